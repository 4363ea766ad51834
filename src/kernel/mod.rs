//! The kernel - green threads, scheduling and synchronization
//!
//! A miniature kernel running in one process:
//! - Fixed thread table, ids are slot indices
//! - Strict priority scheduling, FIFO within a level
//! - Blocking mutex and condition variable built on the scheduler
//! - A reaper thread that reclaims exited threads
//!
//! At most one green thread executes at any instant. The free functions in
//! this module act on the runtime of the calling green thread.

pub mod condvar;
pub mod config;
pub mod context;
pub mod error;
pub mod mutex;
pub mod reaper;
pub mod runtime;
pub mod sched;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod trace;


pub use condvar::CondVar;
pub use config::{RuntimeConfig, ShutdownPolicy};
pub use error::{Result, ThreadError};
pub use mutex::Mutex;
pub use runtime::{RunReport, Runtime, RuntimeBuilder};
pub use stack::{Stack, StackAllocator, StackPool};
pub use thread::{Builder, DetachState, ThreadId, ThreadState};
pub use timer::NoPreempt;
pub use trace::{SchedStats, TraceEvent, TraceKind};

use runtime::{ExitUnwind, RetiredUnwind, Shared};
use sched::RunQueues;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use thread::{ThreadSpec, ThreadTable};
use trace::TraceBuffer;

/// Maximum number of threads alive at once, reaper included
pub const MAX_THREADS: usize = 64;

/// Highest priority level; the first thread and the reaper run here
pub const MAX_PRIO: Priority = 7;

/// Scheduling priority, `0..=MAX_PRIO`, higher runs first
pub type Priority = u8;

/// Value a thread exits with
pub type ExitStatus = i64;

thread_local! {
    /// The runtime whose green threads this OS thread is carrying
    static RUNTIME: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Swap the OS thread's runtime, returns the previous one
pub(crate) fn install(shared: Option<Arc<Shared>>) -> Option<Arc<Shared>> {
    RUNTIME.with(|rt| rt.replace(shared))
}

/// The calling thread's runtime; calling outside one is a bug
pub(crate) fn handle() -> Arc<Shared> {
    RUNTIME.with(|rt| rt.borrow().clone()).unwrap_or_else(|| {
        panic!("uthreads: called outside of a green thread")
    })
}

/// All scheduler and lifecycle state of one runtime
pub struct Kernel {
    pub(crate) table: ThreadTable,
    pub(crate) runq: RunQueues,
    pub(crate) reap_queue: VecDeque<ThreadId>,
    pub(crate) current: Option<ThreadId>,
    pub(crate) reaper: Option<ThreadId>,
    pub(crate) stacks: Box<dyn StackAllocator>,
    pub(crate) stack_size: usize,
    pub(crate) trace: TraceBuffer,
}

impl Kernel {
    pub fn new(config: &RuntimeConfig, stacks: Box<dyn StackAllocator>) -> Self {
        Self {
            table: ThreadTable::new(),
            runq: RunQueues::new(),
            reap_queue: VecDeque::new(),
            current: None,
            reaper: None,
            stacks,
            stack_size: config.stack_size,
            trace: TraceBuffer::new(config.trace_capacity),
        }
    }

    pub fn table(&self) -> &ThreadTable {
        &self.table
    }

    pub fn run_queues(&self) -> &RunQueues {
        &self.runq
    }

    pub fn reap_queue(&self) -> &VecDeque<ThreadId> {
        &self.reap_queue
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }
}

// ============================================================================
// Thread lifecycle
// ============================================================================

/// Create a detachable thread running `entry` at `priority`
///
/// Yields right away if the new thread outranks the caller.
pub fn create<F>(entry: F, priority: Priority) -> Result<ThreadId>
where
    F: FnOnce() -> ExitStatus + Send + 'static,
{
    let rt = handle();
    let result = rt.create(ThreadSpec::new(priority), Box::new(entry));
    rt.track(result)
}

/// Terminate the calling thread with `status`
///
/// Unwinds the thread's frames (running destructors) down to its entry
/// point, where the exit protocol runs. Does not return.
///
/// The unwind can be intercepted by a `catch_unwind` in the thread's own
/// code, which would swallow the exit. Code that catches panics must hand
/// runtime unwinds back:
///
/// ```ignore
/// if let Err(payload) = std::panic::catch_unwind(body) {
///     if kernel::is_runtime_unwind(&*payload) {
///         std::panic::resume_unwind(payload);
///     }
/// }
/// ```
pub fn exit(status: ExitStatus) -> ! {
    // Fails loudly outside a runtime
    let _ = handle();
    std::panic::resume_unwind(Box::new(ExitUnwind(status)))
}

/// True for the unwinds `exit` and runtime teardown drive through a
/// thread's frames; a `catch_unwind` that sees one must re-raise it
pub fn is_runtime_unwind(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<ExitUnwind>() || payload.is::<RetiredUnwind>()
}

/// Wait for a joinable thread to exit and collect its status
pub fn join(id: ThreadId) -> Result<ExitStatus> {
    let rt = handle();
    let result = rt.join(id);
    rt.track(result)
}

/// Make a joinable thread detachable
pub fn detach(id: ThreadId) -> Result<()> {
    let rt = handle();
    let result = rt.detach(id);
    rt.track(result)
}

/// Id of the calling thread
pub fn current() -> ThreadId {
    handle().current()
}

// ============================================================================
// Scheduling
// ============================================================================

/// Give up the CPU to an equal or higher priority thread, if any
pub fn yield_now() {
    handle().yield_now();
}

/// Make a blocked thread runnable; no-op if it already is
///
/// Every blocking call rechecks its condition once woken, so a stray wake
/// only costs the sleeper a trip through the scheduler. Exited threads
/// report `NoSuchThread`.
pub fn wake(id: ThreadId) -> Result<()> {
    let rt = handle();
    let result = rt.wake(id);
    rt.track(result)
}

/// Change a thread's priority, yielding if the caller is now outranked
pub fn set_priority(id: ThreadId, priority: Priority) -> Result<()> {
    let rt = handle();
    let result = rt.set_priority(id, priority);
    rt.track(result)
}

pub fn priority(id: ThreadId) -> Result<Priority> {
    let rt = handle();
    let result = rt.lock().table.get(id).map(|t| t.priority);
    rt.track(result)
}

/// State of a slot; free slots report `NoState`
pub fn thread_state(id: ThreadId) -> Result<ThreadState> {
    let rt = handle();
    let result = rt.lock().table.get(id).map(|t| t.state);
    rt.track(result)
}

pub fn thread_name(id: ThreadId) -> Result<Option<String>> {
    let rt = handle();
    let result = rt.lock().table.get(id).map(|t| t.name.clone());
    rt.track(result)
}

/// errno of the calling thread's last failed call
pub fn last_error() -> i32 {
    let rt = handle();
    let k = rt.lock();
    let id = k.current_id();
    k.table[id].errno
}

// ============================================================================
// Preemption
// ============================================================================

/// Enter a section the quantum timer cannot interrupt
pub fn no_preempt() -> NoPreempt {
    handle().no_preempt()
}

/// Yield here if the quantum has expired
pub fn preempt_point() {
    handle().preempt_point();
}

/// Deliver a quantum expiry by hand, as the ticker does
pub fn expire_quantum() {
    handle().expire_quantum();
}

// ============================================================================
// Introspection
// ============================================================================

pub fn stats() -> SchedStats {
    handle().lock().trace.stats().clone()
}

pub fn trace() -> Vec<TraceEvent> {
    handle().lock().trace.snapshot()
}
