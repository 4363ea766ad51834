//! Thread control blocks and lifecycle
//!
//! A thread is a slot in a fixed-capacity [`ThreadTable`]. Its id is its
//! index, so ids are stable and reused once the reaper frees the slot.
//!
//! Lifecycle:
//! - `NoState -> Transition` at create (stack and context allocated)
//! - `Transition -> Runnable` at the first priority assignment
//! - `Runnable <-> OnCpu <-> Wait` driven by the scheduler and sync calls
//! - `-> Zombie` once handed to the reaper (detached exit, or after join)
//! - `Zombie -> NoState` only in the reaper

use super::context::{Context, Resume};
use super::error::{Result, ThreadError};
use super::runtime::{Entry, Shared};
use super::stack::Stack;
use super::trace::TraceKind;
use super::{handle, ExitStatus, Kernel, Priority, MAX_PRIO, MAX_THREADS};
use serde::Serialize;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Thread identifier; also the thread's slot in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    /// Free slot
    NoState,
    /// Allocated, not yet on a ready queue
    Transition,
    /// On a ready queue
    Runnable,
    /// Currently executing
    OnCpu,
    /// Blocked until woken
    Wait,
    /// Exited, waiting for the reaper
    Zombie,
}

/// Whether another thread may collect this one's exit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DetachState {
    #[default]
    Detachable,
    Joinable,
}

/// The container a thread is currently linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueKind {
    Ready,
    Reap,
    Mutex,
    CondVar,
    Join,
}

/// Per-thread record
#[derive(Debug)]
pub struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) state: ThreadState,
    pub(crate) context: Option<Context>,
    pub(crate) stack: Option<Stack>,
    pub(crate) priority: Priority,
    pub(crate) detach: DetachState,
    pub(crate) has_exited: bool,
    pub(crate) exit_value: Option<ExitStatus>,
    pub(crate) waiter: Option<ThreadId>,
    pub(crate) link: Option<QueueKind>,
    pub(crate) no_preempt: u32,
    pub(crate) errno: i32,
    pub(crate) name: Option<String>,
}

impl Tcb {
    fn empty(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::NoState,
            context: None,
            stack: None,
            priority: 0,
            detach: DetachState::Detachable,
            has_exited: false,
            exit_value: None,
            waiter: None,
            link: None,
            no_preempt: 0,
            errno: 0,
            name: None,
        }
    }

    /// Fill a free slot; the thread stays in `Transition` until scheduled
    pub(crate) fn install(&mut self, context: Context, stack: Stack, spec: &ThreadSpec) {
        *self = Tcb {
            context: Some(context),
            stack: Some(stack),
            priority: spec.priority,
            detach: spec.detach,
            name: spec.name.clone(),
            state: ThreadState::Transition,
            ..Tcb::empty(self.id)
        };
    }

    /// Back to a free slot. Context and stack must already be taken.
    pub(crate) fn reset(&mut self) {
        *self = Tcb::empty(self.id);
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn detach_state(&self) -> DetachState {
        self.detach
    }

    pub fn has_exited(&self) -> bool {
        self.has_exited
    }

    pub fn exit_value(&self) -> Option<ExitStatus> {
        self.exit_value
    }

    pub fn waiter(&self) -> Option<ThreadId> {
        self.waiter
    }

    pub fn link(&self) -> Option<QueueKind> {
        self.link
    }

    pub fn no_preempt_count(&self) -> u32 {
        self.no_preempt
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Fixed-capacity registry of every thread
#[derive(Debug)]
pub struct ThreadTable {
    slots: Vec<Tcb>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_THREADS).map(|i| Tcb::empty(ThreadId(i))).collect(),
        }
    }

    /// Lowest free slot
    pub fn alloc(&self) -> Result<ThreadId> {
        self.slots
            .iter()
            .find(|t| t.state == ThreadState::NoState)
            .map(|t| t.id)
            .ok_or(ThreadError::NoResources)
    }

    pub fn get(&self, id: ThreadId) -> Result<&Tcb> {
        self.slots.get(id.0).ok_or(ThreadError::InvalidArgument)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Result<&mut Tcb> {
        self.slots.get_mut(id.0).ok_or(ThreadError::InvalidArgument)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.slots.iter_mut()
    }

    /// Slots not in `NoState`
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|t| t.state != ThreadState::NoState)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<ThreadId> for ThreadTable {
    type Output = Tcb;

    fn index(&self, id: ThreadId) -> &Tcb {
        &self.slots[id.0]
    }
}

impl IndexMut<ThreadId> for ThreadTable {
    fn index_mut(&mut self, id: ThreadId) -> &mut Tcb {
        &mut self.slots[id.0]
    }
}

/// Creation parameters
#[derive(Debug, Clone)]
pub(crate) struct ThreadSpec {
    pub(crate) priority: Priority,
    pub(crate) detach: DetachState,
    pub(crate) name: Option<String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadSpec {
    pub(crate) fn new(priority: Priority) -> Self {
        Self {
            priority,
            detach: DetachState::Detachable,
            name: None,
            stack_size: None,
        }
    }
}

/// Thread factory
///
/// # Example
/// ```ignore
/// let id = Builder::new().priority(3).joinable().spawn(|| 42)?;
/// assert_eq!(join(id)?, 42);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    spec: ThreadSpec,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            spec: ThreadSpec::new(0),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.spec.priority = priority;
        self
    }

    /// Let another thread collect the exit value with `join`
    pub fn joinable(mut self) -> Self {
        self.spec.detach = DetachState::Joinable;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.spec.stack_size = Some(size);
        self
    }

    /// Create the thread. Its return value is its exit status.
    pub fn spawn<F>(self, entry: F) -> Result<ThreadId>
    where
        F: FnOnce() -> ExitStatus + Send + 'static,
    {
        let rt = handle();
        let result = rt.create(self.spec, Box::new(entry));
        rt.track(result)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Allocate a slot, a stack and a context. Leaves the thread in `Transition`.
    pub(crate) fn spawn_thread(
        &mut self,
        shared: &Arc<Shared>,
        spec: &ThreadSpec,
        entry: Entry,
    ) -> Result<ThreadId> {
        if spec.priority > MAX_PRIO {
            return Err(ThreadError::InvalidArgument);
        }
        let id = self.table.alloc()?;
        let size = spec.stack_size.unwrap_or(self.stack_size);
        let mut stack = self.stacks.allocate(size).ok_or(ThreadError::NoMemory)?;

        let owner = Arc::clone(shared);
        let context = match Context::make(&mut stack, move |resume| {
            super::runtime::thread_main(owner, entry, resume)
        }) {
            Ok(context) => context,
            Err(_) => {
                // Slot was never marked, only the stack needs undoing
                self.stacks.release(stack);
                return Err(ThreadError::NoMemory);
            }
        };

        self.table[id].install(context, stack, spec);
        self.trace.record(TraceKind::Created {
            id,
            priority: spec.priority,
        });
        Ok(id)
    }
}

impl Shared {
    /// create: allocate, then assign the priority, which first enqueues it
    pub(crate) fn create(self: &Arc<Self>, spec: ThreadSpec, entry: Entry) -> Result<ThreadId> {
        let _guard = self.no_preempt();
        let mut k = self.lock();
        let id = k.spawn_thread(self, &spec, entry)?;
        let should_yield = k.set_priority(id, spec.priority)?;
        drop(k);
        if should_yield {
            self.yield_now();
        }
        Ok(id)
    }

    /// The exit protocol. Runs on the exiting thread's own stack, at the
    /// bottom of its trampoline, and returns only once the thread's context
    /// has been retired.
    pub(crate) fn finish(&self, status: ExitStatus) {
        let (me, reap_self) = {
            let mut k = self.lock();
            let me = k.current_id();
            let tcb = &mut k.table[me];
            // Never runs user code again; preemption would requeue a dead thread
            tcb.no_preempt += 1;
            tcb.has_exited = true;
            tcb.exit_value = Some(status);
            let waiter = tcb.waiter;
            let detached = tcb.detach == DetachState::Detachable;
            k.trace.record(TraceKind::Exited { id: me, status });

            match waiter {
                Some(joiner) => {
                    // The joiner hands us to the reaper
                    k.wake(joiner);
                    (me, false)
                }
                None => (me, detached),
            }
        };

        if reap_self {
            self.make_reapable(me);
        }

        let mut k = self.lock();
        if k.table[me].state != ThreadState::Zombie {
            k.table[me].state = ThreadState::Wait;
        }
        // Only the reaper or teardown may bring us back, by retiring us
        if self.reschedule(k) == Resume::Running {
            crate::fatal!("{} resumed after exit", me);
        }
    }

    pub(crate) fn join(self: &Arc<Self>, id: ThreadId) -> Result<ExitStatus> {
        let _guard = self.no_preempt();
        let mut k = self.lock();
        let me = k.current_id();
        let target = k.table.get(id)?;

        if matches!(target.state, ThreadState::NoState | ThreadState::Zombie) {
            return Err(ThreadError::NoSuchThread);
        }
        if id == me {
            return Err(ThreadError::InvalidArgument);
        }
        if target.detach == DetachState::Detachable {
            return Err(ThreadError::NotJoinable);
        }
        if target.waiter.is_some() {
            return Err(ThreadError::AlreadyJoined);
        }

        if !target.has_exited {
            k.table[id].waiter = Some(me);
            // A stray wake() can run us early; only the target's exit counts
            while !k.table[id].has_exited {
                k.block(me, QueueKind::Join);
                super::runtime::resumed(self.reschedule(k));
                k = self.lock();
            }
        }

        let status = k.table[id].exit_value.unwrap_or_default();
        drop(k);
        self.make_reapable(id);
        Ok(status)
    }

    pub(crate) fn detach(self: &Arc<Self>, id: ThreadId) -> Result<()> {
        let _guard = self.no_preempt();
        let mut k = self.lock();
        let target = k.table.get_mut(id)?;

        if matches!(target.state, ThreadState::NoState | ThreadState::Zombie) {
            return Err(ThreadError::NoSuchThread);
        }
        if target.detach == DetachState::Detachable {
            return Err(ThreadError::NotJoinable);
        }
        if target.waiter.is_some() {
            return Err(ThreadError::AlreadyJoined);
        }

        target.detach = DetachState::Detachable;
        let exited = target.has_exited;
        drop(k);
        if exited {
            self.make_reapable(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ids_match_slots() {
        let table = ThreadTable::new();
        assert_eq!(table.capacity(), MAX_THREADS);
        for (i, tcb) in table.iter().enumerate() {
            assert_eq!(tcb.id(), ThreadId(i));
            assert_eq!(tcb.state(), ThreadState::NoState);
        }
    }

    #[test]
    fn test_alloc_finds_lowest_free() {
        let mut table = ThreadTable::new();
        assert_eq!(table.alloc().unwrap(), ThreadId(0));

        table[ThreadId(0)].state = ThreadState::Runnable;
        table[ThreadId(1)].state = ThreadState::Wait;
        assert_eq!(table.alloc().unwrap(), ThreadId(2));

        table[ThreadId(0)].state = ThreadState::NoState;
        assert_eq!(table.alloc().unwrap(), ThreadId(0));
    }

    #[test]
    fn test_alloc_full_table() {
        let mut table = ThreadTable::new();
        for tcb in table.iter_mut() {
            tcb.state = ThreadState::Wait;
        }
        assert_eq!(table.alloc(), Err(ThreadError::NoResources));
        assert_eq!(table.live_count(), MAX_THREADS);
    }

    #[test]
    fn test_get_out_of_range() {
        let table = ThreadTable::new();
        assert!(table.get(ThreadId(MAX_THREADS - 1)).is_ok());
        assert_eq!(
            table.get(ThreadId(MAX_THREADS)).unwrap_err(),
            ThreadError::InvalidArgument
        );
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut table = ThreadTable::new();
        let tcb = &mut table[ThreadId(5)];
        tcb.state = ThreadState::Zombie;
        tcb.priority = 4;
        tcb.detach = DetachState::Joinable;
        tcb.has_exited = true;
        tcb.exit_value = Some(9);
        tcb.waiter = Some(ThreadId(1));
        tcb.errno = -22;

        tcb.reset();
        assert_eq!(tcb.id(), ThreadId(5));
        assert_eq!(tcb.state(), ThreadState::NoState);
        assert_eq!(tcb.detach_state(), DetachState::Detachable);
        assert!(!tcb.has_exited());
        assert_eq!(tcb.exit_value(), None);
        assert_eq!(tcb.waiter(), None);
        assert_eq!(tcb.errno(), 0);
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Builder::new();
        assert_eq!(builder.spec.priority, 0);
        assert_eq!(builder.spec.detach, DetachState::Detachable);

        let builder = Builder::new().priority(3).joinable().name("worker");
        assert_eq!(builder.spec.priority, 3);
        assert_eq!(builder.spec.detach, DetachState::Joinable);
        assert_eq!(builder.spec.name.as_deref(), Some("worker"));
    }

    #[test]
    fn test_thread_id_display() {
        assert_eq!(format!("{}", ThreadId(7)), "Thread(7)");
    }
}
