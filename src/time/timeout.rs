//! Deadline combinator for futures.

use crate::error::{Error, Result};
use crate::time::sleep::{Sleep, sleep};

use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Runs `future` for at most `duration`.
///
/// Resolves to `Err(Error::Timeout(duration))` if the deadline passes first;
/// the inner future is then dropped by the caller, cancelling whatever it
/// was waiting on.
///
/// # Example
/// ```no_run
/// use netcore::time::{sleep, timeout};
/// use netcore::Executor;
/// use std::time::Duration;
///
/// let executor = Executor::new("deadline", 1)?;
/// let result = executor.block_on(timeout(Duration::from_millis(10), async {
///     sleep(Duration::from_secs(1)).await;
/// }))?;
/// assert!(result.unwrap_err().is_timeout());
/// # Ok::<(), netcore::Error>(())
/// ```
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
        duration,
    }
}

pin_project! {
    /// Future returned by [`timeout`].
    #[must_use = "futures do nothing unless awaited"]
    pub struct Timeout<F> {
        #[pin]
        future: F,
        sleep: Sleep,
        duration: Duration,
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        match Pin::new(this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::Timeout(*this.duration))),
            Poll::Pending => Poll::Pending,
        }
    }
}
