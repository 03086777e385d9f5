//! Thread-local runtime context.
//!
//! Worker threads, [`crate::Handle::block_on`] and
//! [`crate::runtime::block_on_for`] install the reactor (and, on executor
//! threads, the executor handle) for the duration of their loop so that
//! primitives such as [`crate::time::sleep`] find them without an explicit
//! argument. The previous context is restored on exit.

use crate::reactor::Reactor;
use crate::runtime::executor::Handle;

use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Handle of the executor whose worker, or `block_on` call, this is.
    static CURRENT_HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };

    /// Reactor that futures polled on this thread register with.
    static CURRENT_REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

struct Restore {
    handle: Option<Handle>,
    reactor: Option<Arc<Reactor>>,
}

impl Drop for Restore {
    fn drop(&mut self) {
        let handle = self.handle.take();
        let reactor = self.reactor.take();
        CURRENT_HANDLE.with(|current| *current.borrow_mut() = handle);
        CURRENT_REACTOR.with(|current| *current.borrow_mut() = reactor);
    }
}

/// Runs `function` with `reactor` and `handle` installed as the current
/// context of this thread.
pub(crate) fn enter_context<F, R>(reactor: Arc<Reactor>, handle: Option<Handle>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous_handle = CURRENT_HANDLE.with(|current| current.borrow_mut().take());
    let previous_reactor = CURRENT_REACTOR.with(|current| current.borrow_mut().replace(reactor));
    CURRENT_HANDLE.with(|current| *current.borrow_mut() = handle);

    // Restores even when `function` unwinds.
    let _restore = Restore {
        handle: previous_handle,
        reactor: previous_reactor,
    };

    function()
}

pub(crate) fn current_handle() -> Option<Handle> {
    CURRENT_HANDLE.with(|current| current.borrow().clone())
}

pub(crate) fn current_reactor() -> Option<Arc<Reactor>> {
    CURRENT_REACTOR.with(|current| current.borrow().clone())
}

/// Returns the current reactor.
///
/// # Panics
/// Panics outside an executor worker, `Handle::block_on` or `block_on_for`.
pub(crate) fn expect_reactor() -> Arc<Reactor> {
    current_reactor().unwrap_or_else(|| {
        panic!("no reactor in current context; call from an executor or block_on")
    })
}
