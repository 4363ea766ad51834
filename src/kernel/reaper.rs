//! The reaper
//!
//! A `MAX_PRIO` thread created at boot. It sleeps on the reap condition
//! until zombies are queued, destroys them, and shuts the runtime down once
//! it is the only thread left.

use super::config::ShutdownPolicy;
use super::runtime::{Outcome, Shared};
use super::thread::{QueueKind, ThreadId, ThreadState};
use super::trace::TraceKind;
use super::{ExitStatus, Kernel};
use std::sync::Arc;

impl Kernel {
    /// Free a zombie's stack and context and return its slot
    pub(crate) fn destroy(&mut self, id: ThreadId) {
        let tcb = &mut self.table[id];
        if tcb.state != ThreadState::Zombie {
            let state = tcb.state;
            crate::fatal!("destroy of {} in state {:?}", id, state);
        }
        // The zombie is parked in its exit path, which returns without the kernel lock
        if let Some(context) = tcb.context.take()
            && let Some(memory) = context.retire()
            && let Some(stack) = tcb.stack.as_mut()
        {
            stack.restore_memory(memory);
        }
        if let Some(stack) = tcb.stack.take() {
            self.stacks.release(stack);
        }
        tcb.reset();
        self.trace.record(TraceKind::Reaped(id));
    }

    /// Destroy everything on the reap queue, returns how many
    pub(crate) fn drain_reap_queue(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(id) = self.reap_queue.pop_front() {
            self.destroy(id);
            reaped += 1;
        }
        reaped
    }

    /// Only the reaper holds a slot
    pub(crate) fn is_quiescent(&self) -> bool {
        self.table
            .iter()
            .all(|t| Some(t.id) == self.reaper || t.state == ThreadState::NoState)
    }
}

impl Shared {
    /// Hand a thread to the reaper
    pub(crate) fn make_reapable(&self, id: ThreadId) {
        self.reap_lock.lock();
        {
            let mut k = self.lock();
            if k.table[id].state == ThreadState::Zombie {
                drop(k);
                crate::fatal!("{} handed to the reaper twice", id);
            }
            let tcb = &mut k.table[id];
            tcb.state = ThreadState::Zombie;
            tcb.link = Some(QueueKind::Reap);
            k.reap_queue.push_back(id);
        }
        self.reap_cond.signal();
        self.reap_lock.unlock();
    }

    fn reap_queue_empty(&self) -> bool {
        self.lock().reap_queue.is_empty()
    }

    /// Reaper main loop. Never returns normally.
    pub(crate) fn reap_forever(self: &Arc<Self>) -> ExitStatus {
        self.reap_lock.lock();
        loop {
            while self.reap_queue_empty() {
                self.reap_cond.wait(&self.reap_lock);
            }

            let quiescent = {
                let mut k = self.lock();
                k.drain_reap_queue();
                k.is_quiescent()
            };

            if quiescent {
                self.shutdown();
            }
        }
    }

    fn shutdown(&self) -> ! {
        match self.config.shutdown {
            ShutdownPolicy::ExitProcess => {
                crate::console_log!("uthreads: no more threads.");
                crate::console_log!("uthreads: bye!");
                std::process::exit(0);
            }
            ShutdownPolicy::ReturnToHost => {
                self.set_outcome(Outcome::Quiescent);
                let me = {
                    let k = self.lock();
                    let id = k.current_id();
                    k.table[id].context
                };
                let Some(me) = me else {
                    crate::fatal!("reaper has no context");
                };
                // The host retires us during teardown
                super::runtime::resumed(super::context::switch(&me, &self.host));
                crate::fatal!("reaper resumed after shutdown");
            }
        }
    }
}
