//! Runtime object, boot and shutdown
//!
//! `Runtime::run` turns the calling OS thread into the host context: it
//! boots the first thread and the reaper, then drives context switches from
//! its own stack until the reaper reports quiescence (or a thread crashes).
//! Every green thread executes on that same OS thread.
//!
//! Every green thread starts in [`thread_main`], which catches the three
//! ways a thread's frames unwind:
//! - `exit()` unwinds with [`ExitUnwind`] carrying the status
//! - a retired context unwinds with [`RetiredUnwind`]
//! - anything else is a panic, which is fatal for the whole runtime

use super::condvar::CondVar;
use super::config::{RuntimeConfig, ShutdownPolicy};
use super::context::{self, Context, Resume};
use super::error::{Result, ThreadError};
use super::mutex::Mutex;
use super::stack::{StackAllocator, StackPool};
use super::thread::{ThreadId, ThreadSpec, ThreadState};
use super::trace::{SchedStats, TraceEvent};
use super::{install, ExitStatus, Kernel, MAX_PRIO};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

/// A thread body; its return value is its exit status
pub(crate) type Entry = Box<dyn FnOnce() -> ExitStatus + Send + 'static>;

/// Payload carried by `exit()` down to the trampoline
pub(crate) struct ExitUnwind(pub(crate) ExitStatus);

/// Payload used to unwind a retired thread
pub(crate) struct RetiredUnwind;

/// Unwind out of the current thread if its context was retired
pub(crate) fn resumed(resume: Resume) {
    if resume == Resume::Retired {
        panic::resume_unwind(Box::new(RetiredUnwind));
    }
}

/// Why the host was woken
pub(crate) enum Outcome {
    Quiescent,
    Crashed(Box<dyn Any + Send>),
}

/// State shared by every thread of one runtime
pub(crate) struct Shared {
    kernel: std::sync::Mutex<Kernel>,
    pub(crate) config: RuntimeConfig,
    pub(crate) host: Context,
    pub(crate) preempt_pending: AtomicBool,
    pub(crate) reap_lock: Mutex,
    pub(crate) reap_cond: CondVar,
    outcome: std::sync::Mutex<Option<Outcome>>,
    stopped: AtomicBool,
}

impl Shared {
    fn new(config: RuntimeConfig, stacks: Box<dyn StackAllocator>) -> Self {
        let kernel = Kernel::new(&config, stacks);
        Self {
            kernel: std::sync::Mutex::new(kernel),
            config,
            host: Context::capture(),
            preempt_pending: AtomicBool::new(false),
            reap_lock: Mutex::new(),
            reap_cond: CondVar::new(),
            outcome: std::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Kernel state. A poisoned lock means a kernel panic is already underway.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current(&self) -> ThreadId {
        self.lock().current_id()
    }

    /// Record a failed call in the caller's errno
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let mut k = self.lock();
            if let Some(id) = k.current {
                k.table[id].errno = err.errno();
            }
        }
        result
    }

    pub(crate) fn set_outcome(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        // First outcome wins; a crash during shutdown must not mask it
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn take_outcome(&self) -> Option<Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// A thread panicked
    fn crash(&self, payload: Box<dyn Any + Send>) {
        match self.config.shutdown {
            ShutdownPolicy::ExitProcess => {
                crate::console_log!("uthreads: kernel panic: {}", panic_message(&*payload));
                std::process::abort();
            }
            ShutdownPolicy::ReturnToHost => {
                self.set_outcome(Outcome::Crashed(payload));
                let me = {
                    let k = self.lock();
                    k.current.and_then(|id| k.table[id].context)
                };
                // Parked here until teardown retires us
                if let Some(me) = me {
                    context::switch(&me, &self.host);
                }
            }
        }
    }

    /// Retire every context and free every slot
    fn teardown(&self) -> RunReport {
        self.stopped.store(true, Ordering::SeqCst);
        let contexts: Vec<_> = {
            let mut k = self.lock();
            k.current = None;
            k.table
                .iter_mut()
                .filter_map(|tcb| Some((tcb.id, tcb.context.take()?)))
                .collect()
        };
        // Retired threads unwind through user frames, so not under the lock
        let memory: Vec<_> = contexts
            .into_iter()
            .map(|(id, context)| (id, context.retire()))
            .collect();

        let mut k = self.lock();
        let Kernel { table, stacks, .. } = &mut *k;
        for (id, memory) in memory {
            if let (Some(memory), Some(stack)) = (memory, table[id].stack.as_mut()) {
                stack.restore_memory(memory);
            }
        }
        for tcb in table.iter_mut() {
            if let Some(stack) = tcb.stack.take() {
                stacks.release(stack);
            }
            tcb.reset();
        }
        k.runq = Default::default();
        k.reap_queue.clear();
        k.current = None;
        RunReport {
            stats: k.trace.stats().clone(),
            trace: k.trace.snapshot(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Bottom frame of every green thread
pub(crate) fn thread_main(shared: Arc<Shared>, entry: Entry, resume: Resume) {
    if resume == Resume::Retired {
        return;
    }

    let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(status) => status,
        Err(payload) => match payload.downcast::<ExitUnwind>() {
            Ok(exit) => exit.0,
            Err(payload) => {
                if !payload.is::<RetiredUnwind>() {
                    shared.crash(payload);
                }
                return;
            }
        },
    };

    // exit() and falling off the end meet here
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| shared.finish(status))) {
        if !payload.is::<RetiredUnwind>() {
            shared.crash(payload);
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stats: SchedStats,
    pub trace: Vec<TraceEvent>,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A green-thread runtime, ready to boot
pub struct Runtime {
    config: RuntimeConfig,
    stacks: Box<dyn StackAllocator>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let stacks = Box::new(StackPool::new(config.stack_budget));
        Ok(Self { config, stacks })
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Boot with `main` as thread 0 and run until only the reaper is left
    ///
    /// With `ShutdownPolicy::ExitProcess` this does not return once booted.
    /// A panic in any green thread is re-raised here.
    pub fn run<F>(self, main: F) -> Result<RunReport>
    where
        F: FnOnce() -> ExitStatus + Send + 'static,
    {
        let quantum = self.config.quantum_ms.map(Duration::from_millis);
        let shared = Arc::new(Shared::new(self.config, self.stacks));
        let previous = install(Some(Arc::clone(&shared)));

        let first = match boot(&shared, Box::new(main)) {
            Ok(first) => first,
            Err(err) => {
                shared.teardown();
                install(previous);
                return Err(err);
            }
        };

        let ticker = match quantum {
            Some(quantum) => match super::timer::start_ticker(&shared, quantum) {
                Ok(ticker) => Some(ticker),
                Err(e) => {
                    shared.teardown();
                    install(previous);
                    return Err(ThreadError::InvalidConfig(format!("ticker: {}", e)));
                }
            },
            None => None,
        };

        crate::console_log!("[spindle] booted, {} on cpu", first);
        // Drives every switch until shutdown or a crash names the host
        context::switch(&shared.host, &first_context(&shared, first));

        let report = shared.teardown();
        install(previous);
        if let Some(ticker) = ticker {
            let _ = ticker.join();
        }
        match shared.take_outcome() {
            Some(Outcome::Quiescent) => Ok(report),
            Some(Outcome::Crashed(payload)) => panic::resume_unwind(payload),
            None => crate::fatal!("host resumed without an outcome"),
        }
    }
}

fn first_context(shared: &Shared, first: ThreadId) -> Context {
    match shared.lock().table[first].context {
        Some(context) => context,
        None => crate::fatal!("{} has no context", first),
    }
}

/// Create the first thread (on the CPU) and the reaper (runnable)
fn boot(shared: &Arc<Shared>, main: Entry) -> Result<ThreadId> {
    let mut k = shared.lock();

    let mut spec = ThreadSpec::new(MAX_PRIO);
    spec.name = Some("main".into());
    let first = k.spawn_thread(shared, &spec, main)?;
    k.table[first].state = ThreadState::OnCpu;
    k.current = Some(first);

    let reaper_shared = Arc::clone(shared);
    let mut spec = ThreadSpec::new(MAX_PRIO);
    spec.name = Some("reaper".into());
    let reaper = k.spawn_thread(
        shared,
        &spec,
        Box::new(move || reaper_shared.reap_forever()),
    )?;
    k.set_priority(reaper, MAX_PRIO)?;
    k.reaper = Some(reaper);
    Ok(first)
}

/// Configures a [`Runtime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    stacks: Option<Box<dyn StackAllocator>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = size;
        self
    }

    pub fn stack_budget(mut self, budget: usize) -> Self {
        self.config.stack_budget = Some(budget);
        self
    }

    pub fn quantum(mut self, quantum: Duration) -> Self {
        self.config.quantum_ms = Some(quantum.as_millis() as u64);
        self
    }

    pub fn shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.config.shutdown = policy;
        self
    }

    pub fn trace_capacity(mut self, capacity: usize) -> Self {
        self.config.trace_capacity = capacity;
        self
    }

    /// Use a custom stack allocator instead of the default pool
    pub fn stack_allocator(mut self, stacks: Box<dyn StackAllocator>) -> Self {
        self.stacks = Some(stacks);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let stacks = self
            .stacks
            .unwrap_or_else(|| Box::new(StackPool::new(self.config.stack_budget)));
        Ok(Runtime {
            config: self.config,
            stacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::trace::{TraceCategory, TraceKind};

    #[test]
    fn test_report_json_round_trip() {
        let report = RunReport {
            stats: SchedStats {
                created: 2,
                ..Default::default()
            },
            trace: vec![TraceEvent {
                seq: 0,
                category: TraceCategory::Lifecycle,
                kind: TraceKind::Reaped(ThreadId(2)),
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["stats"]["created"], 2);
        assert_eq!(json["trace"][0]["kind"]["Reaped"], 2);
    }

    #[test]
    fn test_runtime_unwind_payloads() {
        let exit: Box<dyn Any + Send> = Box::new(ExitUnwind(3));
        let retired: Box<dyn Any + Send> = Box::new(RetiredUnwind);
        let other: Box<dyn Any + Send> = Box::new("boom");
        assert!(crate::kernel::is_runtime_unwind(&*exit));
        assert!(crate::kernel::is_runtime_unwind(&*retired));
        assert!(!crate::kernel::is_runtime_unwind(&*other));
        assert_eq!(panic_message(&*other), "boom");
    }
}
