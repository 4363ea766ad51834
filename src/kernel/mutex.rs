//! Blocking mutex
//!
//! Ownership is handed over at unlock time: the head waiter becomes the
//! owner before it is woken, so waiters acquire in arrival order and never
//! re-contest the lock. No priority inheritance.

use super::handle;
use super::thread::{QueueKind, ThreadId};
use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MutexState {
    owner: Option<ThreadId>,
    waiters: VecDeque<ThreadId>,
}

/// A lock owned by at most one green thread
#[derive(Debug, Default)]
pub struct Mutex {
    state: StdMutex<MutexState>,
}

impl Mutex {
    /// Unowned, no waiters
    pub const fn new() -> Self {
        Self {
            state: StdMutex::new(MutexState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MutexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire, blocking behind earlier waiters
    pub fn lock(&self) {
        let rt = handle();
        let _guard = rt.no_preempt();
        let me = rt.current();
        {
            let mut state = self.state();
            let owner = state.owner;
            match owner {
                None => {
                    state.owner = Some(me);
                    return;
                }
                Some(owner) if owner == me => {
                    drop(state);
                    crate::fatal!("{} locked a mutex it already owns", me);
                }
                Some(_) => state.waiters.push_back(me),
            }
        }
        // Stray wakes leave us queued; only a handover ends the wait
        loop {
            rt.block_current(QueueKind::Mutex);
            if self.state().owner == Some(me) {
                return;
            }
        }
    }

    /// Acquire only if unowned
    pub fn try_lock(&self) -> bool {
        let rt = handle();
        let _guard = rt.no_preempt();
        let me = rt.current();
        let mut state = self.state();
        if state.owner.is_none() {
            state.owner = Some(me);
            true
        } else {
            false
        }
    }

    /// Release; the head waiter, if any, becomes the owner
    pub fn unlock(&self) {
        let rt = handle();
        let _guard = rt.no_preempt();
        let me = rt.current();
        let next = {
            let mut state = self.state();
            if state.owner != Some(me) {
                let owner = state.owner;
                drop(state);
                crate::fatal!("{} unlocked a mutex owned by {:?}", me, owner);
            }
            let next = state.waiters.pop_front();
            state.owner = next;
            next
        };
        if let Some(next) = next {
            rt.wake_thread(next);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state().owner
    }

    /// Number of threads blocked in `lock`
    pub fn waiter_count(&self) -> usize {
        self.state().waiters.len()
    }
}
