//! Priority scheduler
//!
//! - One FIFO ready queue per priority level, highest level wins
//! - Ties go to the earliest arrival within the level
//! - Exactly one thread is `OnCpu`; it is never on a ready queue
//! - Blocking, yielding and exiting all end in [`Shared::reschedule`]
//!
//! The scheduler never switches on its own. Preemption requests are
//! consumed at safe points (see [`super::timer`]).

use super::context::{self, Resume};
use super::error::{Result, ThreadError};
use super::runtime::{resumed, Shared};
use super::thread::{QueueKind, ThreadId, ThreadState};
use super::trace::TraceKind;
use super::{Kernel, Priority, MAX_PRIO};
use std::collections::VecDeque;
use std::sync::MutexGuard;

/// Per-priority ready queues
#[derive(Debug)]
pub struct RunQueues {
    queues: Vec<VecDeque<ThreadId>>,
}

impl RunQueues {
    pub fn new() -> Self {
        Self {
            queues: (0..=MAX_PRIO).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Append at the tail of `priority`'s queue
    pub fn push(&mut self, id: ThreadId, priority: Priority) {
        self.queues[priority as usize].push_back(id);
    }

    /// Remove `id` from `priority`'s queue, returns true if it was there
    pub fn remove(&mut self, id: ThreadId, priority: Priority) -> bool {
        let queue = &mut self.queues[priority as usize];
        match queue.iter().position(|&queued| queued == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Head of the highest nonempty queue
    pub fn pop_highest(&mut self) -> Option<ThreadId> {
        self.queues
            .iter_mut()
            .rev()
            .find_map(|queue| queue.pop_front())
    }

    /// Level of the highest nonempty queue
    pub fn highest_priority(&self) -> Option<Priority> {
        self.queues
            .iter()
            .rposition(|queue| !queue.is_empty())
            .map(|level| level as Priority)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.queues.iter().any(|queue| queue.contains(&id))
    }

    /// Threads queued at one level, head first
    pub fn level(&self, priority: Priority) -> impl Iterator<Item = &ThreadId> {
        self.queues[priority as usize].iter()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// The `OnCpu` thread
    pub(crate) fn current_id(&self) -> ThreadId {
        match self.current {
            Some(id) => id,
            None => crate::fatal!("no current thread"),
        }
    }

    /// Mark runnable and append to its priority's queue
    pub(crate) fn make_runnable(&mut self, id: ThreadId) {
        let tcb = &mut self.table[id];
        tcb.state = ThreadState::Runnable;
        tcb.link = Some(QueueKind::Ready);
        self.runq.push(id, tcb.priority);
    }

    /// Mark the thread blocked on `kind`. The caller must reschedule.
    pub(crate) fn block(&mut self, id: ThreadId, kind: QueueKind) {
        let tcb = &mut self.table[id];
        tcb.state = ThreadState::Wait;
        tcb.link = Some(kind);
        self.trace.record(TraceKind::Blocked(id));
    }

    /// Idempotent: runnable or running threads are left alone
    pub(crate) fn wake(&mut self, id: ThreadId) {
        if self.table[id].has_exited {
            crate::fatal!("wake of exited {}", id);
        }
        match self.table[id].state {
            ThreadState::Runnable | ThreadState::OnCpu => {}
            ThreadState::Wait => {
                self.make_runnable(id);
                self.trace.record(TraceKind::Woke(id));
            }
            state => crate::fatal!("wake of {} in state {:?}", id, state),
        }
    }

    /// Change a priority, requeueing if needed. Returns true if the
    /// current thread is now outranked and should yield.
    pub(crate) fn set_priority(&mut self, id: ThreadId, priority: Priority) -> Result<bool> {
        if priority > MAX_PRIO {
            return Err(ThreadError::InvalidArgument);
        }
        let tcb = self.table.get_mut(id)?;
        let old = tcb.priority;
        match tcb.state {
            ThreadState::NoState | ThreadState::Zombie => return Err(ThreadError::NoSuchThread),
            ThreadState::Runnable => {
                tcb.priority = priority;
                self.runq.remove(id, old);
                self.runq.push(id, priority);
            }
            ThreadState::Transition => {
                tcb.priority = priority;
                self.make_runnable(id);
            }
            ThreadState::OnCpu | ThreadState::Wait => tcb.priority = priority,
        }
        if old != priority {
            self.trace.record(TraceKind::PriorityChanged {
                id,
                from: old,
                to: priority,
            });
        }
        Ok(self.outranked())
    }

    /// True if a queued thread has strictly higher priority than the running one
    pub(crate) fn outranked(&self) -> bool {
        let Some(id) = self.current else {
            return false;
        };
        let tcb = &self.table[id];
        tcb.state == ThreadState::OnCpu
            && self
                .runq
                .highest_priority()
                .is_some_and(|level| level > tcb.priority)
    }

    /// Take the next thread off the ready queues and put it on the CPU
    pub(crate) fn pick_next(&mut self) -> Option<ThreadId> {
        let next = self.runq.pop_highest()?;
        let tcb = &mut self.table[next];
        tcb.state = ThreadState::OnCpu;
        tcb.link = None;
        self.current = Some(next);
        Some(next)
    }
}

impl Shared {
    /// The switch algorithm
    ///
    /// The caller has already moved the current thread out of `OnCpu`
    /// (requeued, blocked or zombie). Returns once this thread is picked
    /// again, or immediately if it was picked right away.
    pub(crate) fn reschedule(&self, mut k: MutexGuard<'_, Kernel>) -> Resume {
        let from = k.current_id();
        let Some(next) = k.pick_next() else {
            drop(k);
            crate::fatal!("no runnable threads");
        };
        if next == from {
            return Resume::Running;
        }
        // A request raised for `from` must not preempt `next`
        self.clear_preempt_request();

        k.trace.record(TraceKind::Switched { from, to: next });
        let (Some(save), Some(resume)) = (
            k.table[from].context,
            k.table[next].context,
        ) else {
            drop(k);
            crate::fatal!("switch between {} and {} without a context", from, next);
        };
        drop(k);
        context::switch(&save, &resume)
    }

    /// Requeue the caller at the tail of its level and reschedule
    pub(crate) fn yield_now(&self) {
        let k = self.lock();
        self.yield_locked(k);
    }

    pub(crate) fn yield_locked(&self, mut k: MutexGuard<'_, Kernel>) {
        let me = k.current_id();
        if k.table[me].state != ThreadState::OnCpu {
            let state = k.table[me].state;
            drop(k);
            crate::fatal!("yield from {} in state {:?}", me, state);
        }
        k.make_runnable(me);
        k.trace.record(TraceKind::Yielded(me));
        self.clear_preempt_request();
        resumed(self.reschedule(k));
    }

    /// Block the caller and reschedule; returns once woken and picked
    pub(crate) fn block_current(&self, kind: QueueKind) {
        let mut k = self.lock();
        let me = k.current_id();
        k.block(me, kind);
        resumed(self.reschedule(k));
    }

    /// Wake a thread this runtime parked on one of its own queues
    pub(crate) fn wake_thread(&self, id: ThreadId) {
        self.lock().wake(id);
    }

    /// Public wake: validates the id first
    ///
    /// An exited thread is only ever resumed by retirement, so it reports
    /// `NoSuchThread` like a free slot.
    pub(crate) fn wake(&self, id: ThreadId) -> Result<()> {
        let mut k = self.lock();
        let target = k.table.get(id)?;
        if target.state == ThreadState::NoState || target.has_exited {
            return Err(ThreadError::NoSuchThread);
        }
        k.wake(id);
        Ok(())
    }

    pub(crate) fn set_priority(&self, id: ThreadId, priority: Priority) -> Result<()> {
        let mut k = self.lock();
        if k.set_priority(id, priority)? {
            self.yield_locked(k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_highest_first() {
        let mut runq = RunQueues::new();
        runq.push(ThreadId(1), 3);
        runq.push(ThreadId(2), 5);
        runq.push(ThreadId(3), 1);

        assert_eq!(runq.highest_priority(), Some(5));
        assert_eq!(runq.pop_highest(), Some(ThreadId(2)));
        assert_eq!(runq.pop_highest(), Some(ThreadId(1)));
        assert_eq!(runq.pop_highest(), Some(ThreadId(3)));
        assert_eq!(runq.pop_highest(), None);
        assert!(runq.is_empty());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut runq = RunQueues::new();
        for i in 0..4 {
            runq.push(ThreadId(i), 2);
        }
        let order: Vec<_> = std::iter::from_fn(|| runq.pop_highest()).collect();
        assert_eq!(
            order,
            vec![ThreadId(0), ThreadId(1), ThreadId(2), ThreadId(3)]
        );
    }

    #[test]
    fn test_remove_from_level() {
        let mut runq = RunQueues::new();
        runq.push(ThreadId(1), 4);
        runq.push(ThreadId(2), 4);

        assert!(!runq.remove(ThreadId(1), 3));
        assert!(runq.remove(ThreadId(1), 4));
        assert!(!runq.contains(ThreadId(1)));
        assert_eq!(runq.level(4).copied().collect::<Vec<_>>(), vec![ThreadId(2)]);
        assert_eq!(runq.len(), 1);
    }

    #[test]
    fn test_empty_queues() {
        let mut runq = RunQueues::new();
        assert_eq!(runq.highest_priority(), None);
        assert_eq!(runq.pop_highest(), None);
    }

    #[test]
    fn test_max_prio_level_exists() {
        let mut runq = RunQueues::new();
        runq.push(ThreadId(9), MAX_PRIO);
        runq.push(ThreadId(8), 0);
        assert_eq!(runq.highest_priority(), Some(MAX_PRIO));
        assert_eq!(runq.pop_highest(), Some(ThreadId(9)));
        assert_eq!(runq.highest_priority(), Some(0));
    }
}
