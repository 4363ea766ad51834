//! Condition variables
//!
//! Not tied to a mutex; the caller names one at each `wait`. Releasing the
//! mutex and blocking happen with no other thread running in between, so a
//! `signal` issued after the release cannot be missed.

use super::handle;
use super::mutex::Mutex;
use super::thread::{QueueKind, ThreadId};
use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

/// FIFO queue of threads waiting for a condition
#[derive(Debug, Default)]
pub struct CondVar {
    waiters: StdMutex<VecDeque<ThreadId>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, VecDeque<ThreadId>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release `mutex`, block until signalled, then re-acquire `mutex`
    pub fn wait(&self, mutex: &Mutex) {
        let rt = handle();
        let _guard = rt.no_preempt();
        let me = rt.current();

        self.waiters().push_back(me);
        mutex.unlock();
        rt.block_current(QueueKind::CondVar);

        // A stray wake leaves our entry behind
        self.waiters().retain(|&id| id != me);
        mutex.lock();
    }

    /// Wake the longest waiter; no-op if nobody waits
    pub fn signal(&self) {
        let next = self.waiters().pop_front();
        if let Some(id) = next {
            handle().wake_thread(id);
        }
    }

    /// Wake every waiter, in arrival order
    pub fn broadcast(&self) {
        let all: Vec<ThreadId> = self.waiters().drain(..).collect();
        if all.is_empty() {
            return;
        }
        let rt = handle();
        for id in all {
            rt.wake_thread(id);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_without_waiters_is_noop() {
        // Needs no runtime: nothing to wake
        let cond = CondVar::new();
        cond.signal();
        cond.broadcast();
        assert_eq!(cond.waiter_count(), 0);
    }
}
