//! Reactor-backed delay.

use crate::reactor::{Reactor, TimerAction, TimerKey};
use crate::runtime::context::expect_reactor;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Waits until `duration` has elapsed.
///
/// # Panics
/// The returned future panics when first polled outside an executor worker,
/// `Handle::block_on` or a synchronous socket call.
///
/// # Example
/// ```no_run
/// use netcore::{Executor, time::sleep};
/// use std::time::Duration;
///
/// let executor = Executor::new("sleepy", 1)?;
/// executor.block_on(sleep(Duration::from_millis(10)))?;
/// # Ok::<(), netcore::Error>(())
/// ```
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Waits until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
///
/// Dropping it cancels the underlying reactor timer.
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    deadline: Instant,
    timer: Option<(Arc<Reactor>, TimerKey)>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the deadline has passed.
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Moves the deadline, re-registering on the next poll.
    pub fn reset(&mut self, deadline: Instant) {
        self.cancel();
        self.deadline = deadline;
    }

    fn cancel(&mut self) {
        if let Some((reactor, key)) = self.timer.take() {
            reactor.cancel_timer(key);
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;

        if Instant::now() >= this.deadline {
            this.cancel();
            return Poll::Ready(());
        }

        let registered = match &this.timer {
            Some((reactor, key)) => reactor.update_timer_waker(*key, cx.waker()),
            None => false,
        };

        // First poll, or the timer fired before the deadline was observed here.
        if !registered {
            let reactor = match this.timer.take() {
                Some((reactor, _)) => reactor,
                None => expect_reactor(),
            };
            let key = reactor.add_timer(this.deadline, TimerAction::Wake(cx.waker().clone()));
            this.timer = Some((reactor, key));
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.cancel();
    }
}
