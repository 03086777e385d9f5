//! Closure tasks with an observable lifecycle.
//!
//! A [`Task`] moves through `Created -> Queuing -> Running -> Finished`.
//! The closure receives the task itself so it can poll the cooperative
//! cancellation flag.
//!
//! # Example
//!
//! ```no_run
//! use netcore::{Executor, Task};
//!
//! let executor = Executor::new("workers", 2)?;
//! let task = Task::new("count", |task| {
//!     let mut n = 0u64;
//!     while !task.is_cancelled() && n < 1_000 {
//!         n += 1;
//!     }
//! });
//! executor.post_task(&task)?;
//! task.join()?;
//! # Ok::<(), netcore::Error>(())
//! ```

use crate::error::{Error, Result};

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TaskState {
    Created,
    Queuing,
    Running,
    Finished,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "Created",
            TaskState::Queuing => "Queuing",
            TaskState::Running => "Running",
            TaskState::Finished => "Finished",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type TaskFn = Box<dyn FnOnce(&Task) + Send>;

struct Lifecycle {
    state: TaskState,
    thread: Option<ThreadId>,
    thread_name: Option<String>,
}

/// A named unit of work.
pub struct Task {
    id: u64,
    name: String,
    created: Instant,
    cancelled: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    func: Mutex<Option<TaskFn>>,
}

impl Task {
    /// Creates a task in the `Created` state.
    pub fn new<F>(name: impl Into<String>, func: F) -> Arc<Task>
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Arc::new(Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            created: Instant::now(),
            cancelled: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Created,
                thread: None,
                thread_name: None,
            }),
            changed: Condvar::new(),
            func: Mutex::new(Some(Box::new(func))),
        })
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Task name. Names are not unique.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle.lock().state
    }

    /// Requests cooperative cancellation. Running code is never interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Name of the worker thread that ran the task, once it started.
    pub fn thread_name(&self) -> Option<String> {
        self.lifecycle.lock().thread_name.clone()
    }

    /// Blocks until the task is neither queued nor running.
    ///
    /// Returns immediately for a task that was never posted. Calling this
    /// from inside the task's own closure fails with
    /// [`Error::WouldDeadlock`].
    pub fn join(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TaskState::Running && lifecycle.thread == Some(thread::current().id())
        {
            return Err(Error::WouldDeadlock);
        }

        while matches!(lifecycle.state, TaskState::Queuing | TaskState::Running) {
            self.changed.wait(&mut lifecycle);
        }

        Ok(())
    }

    /// Like [`Task::join`] but gives up after `timeout`.
    ///
    /// Returns `true` if the task is no longer queued or running.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TaskState::Running && lifecycle.thread == Some(thread::current().id())
        {
            return false;
        }

        while matches!(lifecycle.state, TaskState::Queuing | TaskState::Running) {
            if self.changed.wait_until(&mut lifecycle, deadline).timed_out() {
                return !matches!(lifecycle.state, TaskState::Queuing | TaskState::Running);
            }
        }

        true
    }

    /// `Created -> Queuing`. Fails if the task was already posted.
    pub(crate) fn mark_queuing(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != TaskState::Created {
            return Err(Error::invalid_state(format!(
                "task `{}` is already {}",
                self.name, lifecycle.state
            )));
        }
        lifecycle.state = TaskState::Queuing;
        Ok(())
    }

    /// Undoes [`Task::mark_queuing`] when the executor refused the task.
    pub(crate) fn unmark_queuing(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TaskState::Queuing {
            lifecycle.state = TaskState::Created;
        }
        drop(lifecycle);
        self.changed.notify_all();
    }

    pub(crate) fn mark_running(&self) {
        let current = thread::current();
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = TaskState::Running;
        lifecycle.thread = Some(current.id());
        lifecycle.thread_name = current.name().map(str::to_string);
    }

    pub(crate) fn mark_finished(&self) {
        self.lifecycle.lock().state = TaskState::Finished;
        self.changed.notify_all();
    }

    /// Takes the closure; `None` if it already ran.
    pub(crate) fn take_func(&self) -> Option<TaskFn> {
        self.func.lock().take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_on_unposted_task_returns_immediately() {
        let task = Task::new("idle", |_| {});
        assert_eq!(task.state(), TaskState::Created);
        assert!(task.join().is_ok());
        assert!(task.join_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn cannot_queue_twice() {
        let task = Task::new("once", |_| {});
        task.mark_queuing().unwrap();
        assert!(matches!(task.mark_queuing(), Err(Error::InvalidState(_))));

        task.unmark_queuing();
        assert_eq!(task.state(), TaskState::Created);
    }

    #[test]
    fn ids_are_unique() {
        let a = Task::new("same", |_| {});
        let b = Task::new("same", |_| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn join_timeout_expires_while_queued() {
        let task = Task::new("stuck", |_| {});
        task.mark_queuing().unwrap();
        assert!(!task.join_timeout(Duration::from_millis(10)));
    }
}
