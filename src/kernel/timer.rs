//! Time-slice preemption
//!
//! Design:
//! - A ticker thread expires the quantum every `quantum_ms`
//! - Expiry never touches scheduler queues; it only raises a request flag
//! - The flag is consumed at safe points: the end of every runtime critical
//!   section and [`preempt_point`](super::preempt_point)
//! - While the running thread has `no_preempt_count > 0` an expiry is
//!   dropped, not deferred; the next quantum tries again

use super::runtime::Shared;
use super::thread::{ThreadId, ThreadState};
use super::trace::TraceKind;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Critical section guard: the holder cannot be preempted
///
/// Nests. Dropping the outermost guard is a safe point.
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct NoPreempt {
    shared: Arc<Shared>,
    id: ThreadId,
    // Bound to the thread that took it
    _not_send: PhantomData<*const ()>,
}

impl Drop for NoPreempt {
    fn drop(&mut self) {
        // Unwinding out of a retired or exiting thread: the slot may be gone
        if thread::panicking() {
            return;
        }
        let reached_zero = {
            let mut k = self.shared.lock();
            let tcb = &mut k.table[self.id];
            tcb.no_preempt = tcb.no_preempt.saturating_sub(1);
            tcb.no_preempt == 0
        };
        if reached_zero {
            self.shared.preempt_point();
        }
    }
}

impl Shared {
    pub(crate) fn no_preempt(self: &Arc<Self>) -> NoPreempt {
        let mut k = self.lock();
        let id = k.current_id();
        k.table[id].no_preempt += 1;
        NoPreempt {
            shared: Arc::clone(self),
            id,
            _not_send: PhantomData,
        }
    }

    /// Quantum expired: request a yield unless the running thread forbids it
    pub(crate) fn expire_quantum(&self) {
        let mut k = self.lock();
        let Some(id) = k.current else {
            return;
        };
        if k.table[id].no_preempt > 0 {
            self.clear_preempt_request();
            k.trace.record(TraceKind::PreemptSuppressed(id));
            return;
        }
        self.preempt_pending.store(true, Ordering::SeqCst);
        k.trace.record(TraceKind::PreemptRequested(id));
    }

    /// Yield if a preemption request is pending and allowed
    pub(crate) fn preempt_point(&self) {
        if !self.preempt_pending.load(Ordering::SeqCst) {
            return;
        }
        let mut k = self.lock();
        let id = k.current_id();
        let tcb = &k.table[id];
        if tcb.no_preempt > 0 || tcb.state != ThreadState::OnCpu {
            return;
        }
        k.trace.record(TraceKind::Preempted(id));
        self.yield_locked(k);
    }

    pub(crate) fn clear_preempt_request(&self) {
        self.preempt_pending.store(false, Ordering::SeqCst);
    }
}

/// Start the quantum ticker. It holds only a weak handle so an abandoned
/// runtime does not keep it alive.
pub(crate) fn start_ticker(shared: &Arc<Shared>, quantum: Duration) -> std::io::Result<JoinHandle<()>> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    thread::Builder::new()
        .name("uthread-ticker".into())
        .spawn(move || {
            loop {
                thread::sleep(quantum);
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.is_stopped() {
                    break;
                }
                shared.expire_quantum();
            }
        })
}
