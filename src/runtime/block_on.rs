//! Drives a future on the calling thread against a private reactor.
//!
//! The synchronous socket types own a reactor that no executor polls; each
//! blocking call runs it here for at most the call's deadline.

use crate::reactor::Reactor;
use crate::runtime::context::enter_context;

use futures::task::ArcWake;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{error, warn};

struct Notify {
    notified: AtomicBool,
    reactor: Weak<Reactor>,
}

impl ArcWake for Notify {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.notified.swap(true, Ordering::AcqRel) {
            // Wakes from another thread must interrupt a blocked turn.
            if let Some(reactor) = arc_self.reactor.upgrade() {
                reactor.wake();
            }
        }
    }
}

/// Polls `future` until it completes or `timeout` elapses, turning
/// `reactor` in between. A zero `timeout` means no deadline.
///
/// Returns `None` on timeout; the future is dropped, which cancels any
/// operation it had in flight.
pub(crate) fn block_on_for<F: Future>(
    reactor: &Arc<Reactor>,
    future: F,
    timeout: Duration,
) -> Option<F::Output> {
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

    let notify = Arc::new(Notify {
        notified: AtomicBool::new(true),
        reactor: Arc::downgrade(reactor),
    });
    let waker = futures::task::waker(notify.clone());
    let mut cx = Context::from_waker(&waker);

    enter_context(reactor.clone(), None, || {
        let mut future = pin!(future);

        loop {
            if notify.notified.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Some(output);
                }
                continue;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let calls = match reactor.turn(remaining) {
                Ok(calls) => calls,
                Err(err) => {
                    warn!(error = %err, "private reactor turn failed");
                    return None;
                }
            };

            for call in calls {
                if catch_unwind(AssertUnwindSafe(call)).is_err() {
                    error!("timer callback panicked");
                }
            }
        }
    })
}
