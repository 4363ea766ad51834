//! Execution contexts
//!
//! The only platform boundary in the runtime. Every green thread is a
//! stackful coroutine running on the memory of its own [`Stack`], and all of
//! them share the OS thread that called `Runtime::run` (the host).
//!
//! Coroutines can only suspend back to whoever resumed them, so switches go
//! through a trampoline on the host stack:
//! - a green thread switching away suspends, naming its target
//! - the host trampoline resumes that target
//! - naming the host ends the trampoline and returns to `Runtime::run`
//!
//! Retiring a suspended context resumes it one last time with
//! [`Resume::Retired`] so it can unwind to its entry point and hand its
//! stack memory back.

use super::stack::Stack;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use slab::Slab;
use std::cell::RefCell;
use std::io;

/// How a suspended context came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Some switch named this context as its target
    Running,
    /// The context was retired and must not touch the runtime again
    Retired,
}

/// Saved execution state of one thread of control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// The OS thread's own stack
    Host,
    /// A coroutine in this OS thread's carrier table
    Coroutine(usize),
}

type Coro = Coroutine<Resume, Context, (), DefaultStack>;

struct Carried {
    /// None while the coroutine is executing
    coroutine: Option<Coro>,
    yielder: Option<*const Yielder<Resume, Context>>,
}

thread_local! {
    /// Coroutines built on this OS thread, keyed by `Context::Coroutine`
    static CARRIER: RefCell<Slab<Carried>> = RefCell::new(Slab::new());
}

impl Context {
    /// Context for the calling OS thread, which is already executing
    pub fn capture() -> Self {
        Context::Host
    }

    /// Build a context that starts `entry` on `stack` when first switched to
    ///
    /// The stack's memory moves into the context until it is retired.
    /// `entry` receives `Resume::Retired` instead if the context is retired
    /// before it ever ran.
    pub fn make<F>(stack: &mut Stack, entry: F) -> io::Result<Self>
    where
        F: FnOnce(Resume) + 'static,
    {
        let memory = stack
            .take_memory()
            .ok_or_else(|| io::Error::other("stack is already carrying a context"))?;
        CARRIER.with(|carrier| {
            let mut carrier = carrier.borrow_mut();
            let slot = carrier.vacant_entry();
            let key = slot.key();
            let coroutine = Coroutine::with_stack(
                memory,
                move |yielder: &Yielder<Resume, Context>, resume| {
                    register_yielder(key, yielder);
                    entry(resume);
                },
            );
            slot.insert(Carried {
                coroutine: Some(coroutine),
                yielder: None,
            });
            Ok(Context::Coroutine(key))
        })
    }

    /// Run a suspended context to completion with `Resume::Retired`
    ///
    /// Returns the stack memory it was built on. Retiring the host, or a
    /// context that is already gone, returns None.
    pub fn retire(&self) -> Option<DefaultStack> {
        let Context::Coroutine(key) = *self else {
            return None;
        };
        let carried = CARRIER.with(|carrier| carrier.borrow_mut().try_remove(key))?;
        let Some(mut coroutine) = carried.coroutine else {
            crate::fatal!("retire of running context {}", key);
        };
        if !coroutine.done() {
            match coroutine.resume(Resume::Retired) {
                CoroutineResult::Return(()) => {}
                CoroutineResult::Yield(target) => {
                    crate::fatal!("retired context {} switched to {:?}", key, target)
                }
            }
        }
        Some(coroutine.into_stack())
    }
}

fn register_yielder(key: usize, yielder: &Yielder<Resume, Context>) {
    CARRIER.with(|carrier| {
        if let Some(carried) = carrier.borrow_mut().get_mut(key) {
            carried.yielder = Some(yielder as *const _);
        }
    });
}

/// Save the caller into `save` and resume `resume`
///
/// Returns only once some later switch names `save` as its target, or
/// `save` is retired.
pub fn switch(save: &Context, resume: &Context) -> Resume {
    if save == resume {
        return Resume::Running;
    }
    match *save {
        Context::Host => trampoline(*resume),
        Context::Coroutine(key) => {
            let yielder =
                CARRIER.with(|carrier| carrier.borrow().get(key).and_then(|c| c.yielder));
            let Some(yielder) = yielder else {
                crate::fatal!("switch from context {} that is not running", key);
            };
            // SAFETY: the yielder lives on this coroutine's own stack, which
            // is executing right now, and is only dropped when it returns.
            unsafe { (*yielder).suspend(*resume) }
        }
    }
}

/// Host side of every switch: resume targets until one names the host
fn trampoline(mut next: Context) -> Resume {
    loop {
        let key = match next {
            Context::Host => return Resume::Running,
            Context::Coroutine(key) => key,
        };
        let taken = CARRIER.with(|carrier| {
            carrier
                .borrow_mut()
                .get_mut(key)
                .and_then(|c| c.coroutine.take())
        });
        let Some(mut coroutine) = taken else {
            crate::fatal!("switch to missing context {}", key);
        };

        match coroutine.resume(Resume::Running) {
            CoroutineResult::Yield(target) => {
                CARRIER.with(|carrier| {
                    if let Some(carried) = carrier.borrow_mut().get_mut(key) {
                        carried.coroutine = Some(coroutine);
                    }
                });
                next = target;
            }
            CoroutineResult::Return(()) => {
                crate::fatal!("context {} finished without switching away", key)
            }
        }
    }
}
