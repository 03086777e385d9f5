//! One-shot, re-armable timeout timer.
//!
//! Every arming carries a generation number. Re-arming or stopping bumps the
//! generation and cancels the pending reactor timer; if that timer already
//! fired and its callback is queued on a worker, the stale generation makes
//! the callback a no-op. The callback therefore runs exactly once per
//! arming that is allowed to expire.

use crate::reactor::{TimerAction, TimerKey};
use crate::runtime::Handle;

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    timeout: Duration,
    generation: u64,
    started: bool,
    pending: Option<TimerKey>,
}

struct Inner {
    handle: Handle,
    callback: Callback,
    state: Mutex<TimerState>,
}

impl Inner {
    fn fire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if !state.started || state.generation != generation {
                trace!(generation, current = state.generation, "suppressed stale timeout");
                return;
            }
            state.started = false;
            state.pending = None;
        }

        (self.callback)();
    }
}

/// Runs a callback on an executor worker once a timeout expires.
///
/// # Example
/// ```no_run
/// use netcore::{Executor, TimeoutTimer};
/// use std::time::Duration;
///
/// let executor = Executor::new("timers", 1)?;
/// let timer = TimeoutTimer::new(executor.handle(), Duration::from_millis(50), || {
///     println!("timed out");
/// });
/// timer.start();
/// # Ok::<(), netcore::Error>(())
/// ```
pub struct TimeoutTimer {
    inner: Arc<Inner>,
}

impl TimeoutTimer {
    pub fn new<F>(handle: &Handle, timeout: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                handle: handle.clone(),
                callback: Arc::new(callback),
                state: Mutex::new(TimerState {
                    timeout,
                    generation: 0,
                    started: false,
                    pending: None,
                }),
            }),
        }
    }

    /// Arms the timer, replacing any pending expiry.
    ///
    /// On a stopped executor the callback can never run, so the timer is
    /// left disarmed.
    pub fn start(&self) {
        let reactor = self.inner.handle.reactor();
        let mut state = self.inner.state.lock();

        state.generation += 1;
        if let Some(key) = state.pending.take() {
            reactor.cancel_timer(key);
        }

        if self.inner.handle.is_stopped() {
            trace!(executor = %self.inner.handle.name(), "timer not armed on a stopped executor");
            state.started = false;
            return;
        }

        let generation = state.generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = reactor.add_timer(
            Instant::now() + state.timeout,
            TimerAction::Call(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(generation);
                }
            })),
        );

        state.pending = Some(key);
        state.started = true;
    }

    /// Disarms the timer. A callback already queued for this arming is
    /// suppressed.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.started = false;
        if let Some(key) = state.pending.take() {
            self.inner.handle.reactor().cancel_timer(key);
        }
    }

    /// Whether an arming is pending. An executor stopped after arming
    /// drops the callback, so this turns false with it.
    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started && !self.inner.handle.is_stopped()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Changes the timeout used by the next [`TimeoutTimer::start`].
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.state.lock().timeout = timeout;
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimeoutTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TimeoutTimer")
            .field("timeout", &state.timeout)
            .field("started", &state.started)
            .field("generation", &state.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Executor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stale_generation_is_suppressed() {
        let executor = Executor::new("timer-unit", 1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = TimeoutTimer::new(executor.handle(), Duration::from_secs(60), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timer.start();
        let stale = timer.inner.state.lock().generation;
        timer.start();

        // A callback from the first arming that slipped past cancellation.
        timer.inner.fire(stale);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timer.is_started());

        let current = timer.inner.state.lock().generation;
        timer.inner.fire(current);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.is_started());
    }
}
