//! Bounded multi-producer, multi-consumer queue with overflow strategies.
//!
//! ```
//! use netcore::{BoundedQueue, PushStrategy};
//!
//! let queue = BoundedQueue::new(2);
//! assert!(queue.push(1, PushStrategy::DropOldest));
//! assert!(queue.push(2, PushStrategy::DropOldest));
//! assert!(queue.push(3, PushStrategy::DropOldest));
//! assert_eq!(queue.try_pop(), Some(2));
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use tracing::warn;

/// What [`BoundedQueue::push`] does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushStrategy {
    /// Block until space frees up or the queue stops.
    #[default]
    Wait,
    /// Discard the incoming value.
    DropCurrent,
    /// Evict the oldest element to make room.
    DropOldest,
}

type DropCallback<T> = Box<dyn Fn(T) + Send + Sync>;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    stopped: bool,
}

impl<T> Inner<T> {
    fn is_full(&self) -> bool {
        self.capacity > 0 && self.items.len() >= self.capacity
    }
}

/// FIFO queue holding at most `capacity` elements (0 means unbounded).
///
/// Values evicted by [`PushStrategy::DropOldest`], by shrinking the
/// capacity or by [`BoundedQueue::stop`] are handed to the drop callback,
/// outside the queue lock. A panicking callback is logged and ignored.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    on_drop: Option<DropCallback<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            on_drop: None,
        }
    }

    /// Creates a queue that passes every evicted or drained value to `on_drop`.
    pub fn with_drop_callback<F>(capacity: usize, on_drop: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            on_drop: Some(Box::new(on_drop)),
            ..Self::new(capacity)
        }
    }

    /// Appends `value`, applying `strategy` if the queue is full.
    ///
    /// Returns `false` if the value was not enqueued: the queue is stopped,
    /// or it is full under [`PushStrategy::DropCurrent`].
    pub fn push(&self, value: T, strategy: PushStrategy) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return false;
        }

        let mut evicted = None;
        if inner.is_full() {
            match strategy {
                PushStrategy::Wait => {
                    while !inner.stopped && inner.is_full() {
                        self.not_full.wait(&mut inner);
                    }
                    if inner.stopped {
                        return false;
                    }
                }
                PushStrategy::DropOldest => {
                    // Evict and insert under the same lock so concurrent
                    // producers never overshoot the capacity.
                    evicted = inner.items.pop_front();
                }
                PushStrategy::DropCurrent => return false,
            }
        }

        inner.items.push_back(value);
        drop(inner);
        self.not_empty.notify_one();

        if let Some(old) = evicted {
            self.dispose(old);
        }

        true
    }

    /// Removes the head without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return None;
        }

        let value = inner.items.pop_front()?;
        drop(inner);
        self.not_full.notify_one();

        Some(value)
    }

    /// Removes the head, waiting up to `timeout` (zero waits forever).
    ///
    /// Returns `None` on timeout or once the queue is stopped.
    pub fn wait_pop(&self, timeout: Duration) -> Option<T> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut inner = self.inner.lock();

        loop {
            if inner.stopped {
                return None;
            }
            if let Some(value) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(value);
            }

            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut inner, deadline).timed_out()
                        && inner.items.is_empty()
                    {
                        return None;
                    }
                }
                None => self.not_empty.wait(&mut inner),
            }
        }
    }

    /// Removes the first element equal to `value`.
    pub fn remove(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return false;
        }

        let Some(index) = inner.items.iter().position(|item| item == value) else {
            return false;
        };
        inner.items.remove(index);
        drop(inner);
        self.not_full.notify_one();

        true
    }

    /// Removes every element equal to `value` and returns how many matched.
    pub fn remove_all(&self, value: &T) -> usize
    where
        T: PartialEq,
    {
        self.retain(|item| item != value)
    }

    /// Keeps only the elements for which `keep` returns `true`.
    ///
    /// Returns the number of elements removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return 0;
        }

        let before = inner.items.len();
        inner.items.retain(|item| keep(item));
        let removed = before - inner.items.len();
        drop(inner);

        if removed > 0 {
            self.not_full.notify_all();
        }
        removed
    }

    /// Discards every element without calling the drop callback.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        let items = std::mem::take(&mut inner.items);
        drop(inner);

        self.not_full.notify_all();
        drop(items);
    }

    /// Changes the capacity. Shrinking below the current length evicts the
    /// oldest surplus through the drop callback.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        if inner.stopped || inner.capacity == capacity {
            return;
        }

        inner.capacity = capacity;
        let mut evicted = Vec::new();
        if capacity > 0 {
            while inner.items.len() > capacity {
                evicted.extend(inner.items.pop_front());
            }
        }
        drop(inner);

        self.not_full.notify_all();
        for value in evicted {
            self.dispose(value);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Stops the queue: every blocked producer and consumer returns, the
    /// remaining elements go to the drop callback, and all later pushes and
    /// pops fail. Calling it again has no effect.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        let remaining = std::mem::take(&mut inner.items);
        drop(inner);

        self.not_empty.notify_all();
        self.not_full.notify_all();

        for value in remaining {
            self.dispose(value);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Number of queued elements. Only a snapshot under concurrency.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Whether a bounded queue is at capacity. Only a snapshot under concurrency.
    pub fn is_full(&self) -> bool {
        self.inner.lock().is_full()
    }

    fn dispose(&self, value: T) {
        let Some(on_drop) = &self.on_drop else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| on_drop(value))).is_err() {
            warn!("queue drop callback panicked");
        }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// A copy of the head, leaving it queued.
    pub fn try_front(&self) -> Option<T> {
        let inner = self.inner.lock();
        if inner.stopped {
            return None;
        }
        inner.items.front().cloned()
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &inner.capacity)
            .field("stopped", &inner.stopped)
            .finish()
    }
}
