//! spindle - user-level green threads with their own scheduler
//!
//! Design principles:
//! - Tractable: a miniature kernel, comprehensible by one human
//! - One thread on the CPU at a time, always the highest priority one
//! - Fixed capacity: the thread table and priority range are constants
//! - Blocking is explicit: every suspension is a trip through the scheduler
//!
//! ```ignore
//! use spindle::kernel::{self, Builder, Runtime};
//!
//! Runtime::builder().build()?.run(|| {
//!     let worker = Builder::new().priority(2).joinable().spawn(|| 42).unwrap();
//!     assert_eq!(kernel::join(worker), Ok(42));
//!     0
//! })?;
//! ```

pub mod kernel;

pub use kernel::{
    Builder, CondVar, Mutex, RunReport, Runtime, RuntimeConfig, ShutdownPolicy, ThreadError,
    ThreadId, ThreadState,
};

/// Log to stderr
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}

/// Kernel panic: log the diagnostic, then panic the current thread
///
/// Inside a green thread the runtime turns this into a process abort or a
/// panic on the host, depending on the shutdown policy.
#[macro_export]
macro_rules! fatal {
    ($($t:tt)*) => {{
        $crate::console_log!("uthreads: PANIC: {}", format_args!($($t)*));
        panic!($($t)*)
    }};
}
