//! Futures spawned onto an executor and the handles that await them.

use crate::error::{Error, Result, panic_message};
use crate::runtime::executor::Shared;

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::error;

/// Type-erased spawned future as seen by the scheduler.
pub(crate) trait Runnable: Send + Sync {
    /// Polls the future once on the current worker.
    fn run(self: Arc<Self>);

    /// Drops the future without completing it.
    fn abort(&self);
}

struct Completion<T> {
    result: Option<Result<T>>,
    done: bool,
    waker: Option<Waker>,
}

/// Result slot shared between a spawned future and its [`JoinHandle`].
struct JoinState<T> {
    completion: Mutex<Completion<T>>,
    finished: Condvar,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            completion: Mutex::new(Completion {
                result: None,
                done: false,
                waker: None,
            }),
            finished: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T>) {
        let mut completion = self.completion.lock();
        if completion.done {
            return;
        }
        completion.result = Some(result);
        completion.done = true;
        let waker = completion.waker.take();
        drop(completion);

        self.finished.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

pub(crate) struct Spawned<F: Future> {
    pub(crate) id: u64,
    pub(crate) shared: Weak<Shared>,
    future: Mutex<Option<Pin<Box<F>>>>,
    /// Set while a poll is queued, so repeated wakes enqueue once.
    pub(crate) scheduled: AtomicBool,
    join: Arc<JoinState<F::Output>>,
}

impl<F> Spawned<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    pub(crate) fn new(id: u64, shared: Weak<Shared>, future: F) -> (Arc<Self>, JoinHandle<F::Output>) {
        let join = Arc::new(JoinState::new());
        let spawned = Arc::new(Self {
            id,
            shared,
            future: Mutex::new(Some(Box::pin(future))),
            scheduled: AtomicBool::new(true),
            join: join.clone(),
        });

        (spawned, JoinHandle { join })
    }

    /// Resolves the handle with `error` without polling the future again.
    pub(crate) fn reject(&self, error: Error) {
        let future = self.future.lock().take();
        if future.is_some() {
            drop(future);
            self.join.complete(Err(error));
        }
    }

    fn finish(&self, result: Result<F::Output>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.forget_spawned(self.id);
        }
        self.join.complete(result);
    }
}

impl<F> Runnable for Spawned<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn run(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);

        // Holding the slot across the poll serialises concurrent wake-ups:
        // a worker that picks up a re-queued poll waits here and then polls
        // again, so no wake-up is lost.
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };

        let waker = futures::task::waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let result = match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => return,
            Ok(Poll::Ready(output)) => Ok(output),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = self.id, panic = %message, "spawned future panicked");
                Err(Error::Panicked(message))
            }
        };

        *slot = None;
        drop(slot);
        self.finish(result);
    }

    fn abort(&self) {
        self.reject(Error::Aborted);
    }
}

impl<F: Future> Drop for Spawned<F> {
    // Every waker is gone while the future is still pending: nothing can
    // poll it again.
    fn drop(&mut self) {
        if self.future.get_mut().take().is_some() {
            if let Some(shared) = self.shared.upgrade() {
                shared.forget_spawned(self.id);
            }
            self.join.complete(Err(Error::Aborted));
        }
    }
}

/// Owned permission to await a spawned future's output.
///
/// Dropping the handle detaches the future; it keeps running.
///
/// # Example
///
/// ```no_run
/// use netcore::Executor;
///
/// let executor = Executor::new("spawn", 1)?;
/// let handle = executor.spawn(async { 40 + 2 });
/// assert_eq!(handle.join()?, 42);
/// # Ok::<(), netcore::Error>(())
/// ```
pub struct JoinHandle<T> {
    join: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    /// Whether the future completed, panicked or was aborted.
    pub fn is_finished(&self) -> bool {
        self.join.completion.lock().done
    }

    /// Blocks the calling thread until the future resolves.
    ///
    /// Do not call this from a worker of the executor running the future:
    /// with a single worker nothing would be left to poll it.
    pub fn join(self) -> Result<T> {
        let mut completion = self.join.completion.lock();
        while !completion.done {
            self.join.finished.wait(&mut completion);
        }
        take_result(&mut completion)
    }

    /// Like [`JoinHandle::join`] but returns `Err(self)` on timeout.
    pub fn join_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let deadline = Instant::now() + timeout;
        let mut completion = self.join.completion.lock();
        while !completion.done {
            if self
                .join
                .finished
                .wait_until(&mut completion, deadline)
                .timed_out()
                && !completion.done
            {
                drop(completion);
                return Err(self);
            }
        }
        Ok(take_result(&mut completion))
    }
}

fn take_result<T>(completion: &mut Completion<T>) -> Result<T> {
    completion
        .result
        .take()
        .unwrap_or_else(|| Err(Error::invalid_state("join result already taken")))
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut completion = self.join.completion.lock();
        if completion.done {
            return Poll::Ready(take_result(&mut completion));
        }

        if !completion
            .waker
            .as_ref()
            .is_some_and(|w| w.will_wake(cx.waker()))
        {
            completion.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
