use crate::reactor::poller::{Event, Interest, Poller};
use crate::utils::slab::Slab;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::task::Waker;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Readiness direction a future waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Work scheduled at a deadline.
pub(crate) enum TimerAction {
    /// Wake a future; runs inline on the polling thread.
    Wake(Waker),
    /// Run a callback; handed back to the caller of [`Reactor::turn`].
    Call(Box<dyn FnOnce() + Send>),
}

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

struct ScheduledIo {
    fd: RawFd,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl ScheduledIo {
    fn interest(&self) -> Interest {
        Interest {
            read: self.reader.is_some(),
            write: self.writer.is_some(),
        }
    }
}

#[derive(Default)]
struct Timers {
    entries: BTreeMap<TimerKey, TimerAction>,
    next_seq: u64,
}

/// I/O readiness and timer driver shared by all workers of an executor.
///
/// Only one thread blocks in [`Reactor::turn`] at a time; every other
/// operation may be called from any thread, including while a turn is in
/// progress.
pub(crate) struct Reactor {
    poller: Poller,
    sources: Mutex<Slab<ScheduledIo>>,
    timers: Mutex<Timers>,
    events: Mutex<Vec<Event>>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            sources: Mutex::new(Slab::new()),
            timers: Mutex::new(Timers::default()),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Starts tracking a non-blocking descriptor and returns its token.
    pub(crate) fn register(&self, fd: RawFd) -> io::Result<usize> {
        let mut sources = self.sources.lock();
        let token = sources.insert(ScheduledIo {
            fd,
            reader: None,
            writer: None,
        });

        if let Err(err) = self.poller.add(fd, token as u64) {
            sources.remove(token);
            return Err(err);
        }

        trace!(fd, token, "registered source");
        Ok(token)
    }

    /// Stops tracking a descriptor. Pending wakers are woken so their
    /// futures observe the closed source.
    pub(crate) fn deregister(&self, token: usize) {
        let removed = self.sources.lock().remove(token);

        if let Some(io) = removed {
            if let Err(err) = self.poller.delete(io.fd) {
                trace!(fd = io.fd, error = %err, "epoll delete failed");
            }
            for waker in [io.reader, io.writer].into_iter().flatten() {
                waker.wake();
            }
        }
    }

    /// Stores `waker` for `direction` and re-arms the descriptor.
    pub(crate) fn arm(&self, token: usize, direction: Direction, waker: &Waker) -> io::Result<()> {
        let mut sources = self.sources.lock();
        let io = sources
            .get_mut(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source deregistered"))?;

        let slot = match direction {
            Direction::Read => &mut io.reader,
            Direction::Write => &mut io.writer,
        };
        if !slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
            *slot = Some(waker.clone());
        }

        self.poller.rearm(io.fd, token as u64, io.interest())
    }

    /// Schedules `action` at `deadline`.
    pub(crate) fn add_timer(&self, deadline: Instant, action: TimerAction) -> TimerKey {
        let mut timers = self.timers.lock();
        let key = TimerKey {
            deadline,
            seq: timers.next_seq,
        };
        timers.next_seq += 1;
        timers.entries.insert(key, action);

        let earliest = timers.entries.keys().next() == Some(&key);
        drop(timers);

        // The polling thread may be sleeping past the new deadline.
        if earliest {
            self.wake();
        }

        key
    }

    /// Removes a timer that has not fired yet.
    pub(crate) fn cancel_timer(&self, key: TimerKey) -> bool {
        self.timers.lock().entries.remove(&key).is_some()
    }

    /// Replaces the waker of a pending [`TimerAction::Wake`] timer.
    pub(crate) fn update_timer_waker(&self, key: TimerKey, waker: &Waker) -> bool {
        match self.timers.lock().entries.get_mut(&key) {
            Some(TimerAction::Wake(existing)) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
                true
            }
            _ => false,
        }
    }

    /// Drops every pending timer without running it.
    pub(crate) fn clear_timers(&self) {
        let entries = std::mem::take(&mut self.timers.lock().entries);
        drop(entries);
    }

    /// Interrupts a thread blocked in [`Reactor::turn`].
    pub(crate) fn wake(&self) {
        if let Err(err) = self.poller.notify() {
            warn!(error = %err, "failed to interrupt reactor");
        }
    }

    /// Waits for readiness or the next timer, bounded by `timeout`.
    ///
    /// Ready futures and expired `Wake` timers are woken before returning;
    /// expired `Call` timers are returned for the caller to run.
    pub(crate) fn turn(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Box<dyn FnOnce() + Send>>> {
        let timeout = match (timeout, self.next_timer_in()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut events = self.events.lock();
        events.clear();
        self.poller.wait(&mut events, timeout)?;

        let mut ready = Vec::new();
        {
            let mut sources = self.sources.lock();
            for event in events.iter() {
                let Some(io) = sources.get_mut(event.token as usize) else {
                    continue;
                };

                if event.readable {
                    ready.extend(io.reader.take());
                }
                if event.writable {
                    ready.extend(io.writer.take());
                }

                // One-shot mode disabled the descriptor; keep waiting for
                // the direction that did not fire.
                let interest = io.interest();
                if interest != Interest::default() {
                    if let Err(err) = self.poller.rearm(io.fd, event.token, interest) {
                        trace!(fd = io.fd, error = %err, "re-arm failed");
                        ready.extend(io.reader.take());
                        ready.extend(io.writer.take());
                    }
                }
            }
        }
        drop(events);

        for waker in ready {
            waker.wake();
        }

        Ok(self.fire_timers())
    }

    fn next_timer_in(&self) -> Option<Duration> {
        let timers = self.timers.lock();
        let key = timers.entries.keys().next()?;
        Some(key.deadline.saturating_duration_since(Instant::now()))
    }

    fn fire_timers(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let now = Instant::now();
        let expired = {
            let mut timers = self.timers.lock();
            let pending = timers.entries.split_off(&TimerKey {
                deadline: now,
                seq: u64::MAX,
            });
            std::mem::replace(&mut timers.entries, pending)
        };

        let mut calls = Vec::new();
        for action in expired.into_values() {
            match action {
                TimerAction::Wake(waker) => waker.wake(),
                TimerAction::Call(call) => calls.push(call),
            }
        }

        calls
    }

    #[cfg(test)]
    pub(crate) fn source_count(&self) -> usize {
        self.sources.lock().len()
    }
}
