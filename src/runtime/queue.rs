//! Run queue shared by the worker threads of one executor.
//!
//! Workers follow a leader/follower discipline: at most one idle worker
//! blocks in the reactor while the others park on the condition variable.

use crate::runtime::spawn::Runnable;
use crate::runtime::task::Task;

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

/// One unit of work for a worker thread.
pub(crate) enum Job {
    /// A posted closure task.
    Task(Arc<Task>),
    /// A spawned future that was woken.
    Poll(Arc<dyn Runnable>),
    /// A reactor timer callback.
    Call(Box<dyn FnOnce() + Send>),
}

pub(crate) struct QueueState {
    pub(crate) jobs: VecDeque<Job>,
    pub(crate) stopped: bool,
    /// A worker is currently blocked in `Reactor::turn`.
    pub(crate) polling: bool,
}

pub(crate) struct RunQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopped: false,
                polling: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    /// Enqueues `job` unless the queue is stopped.
    ///
    /// Returns `Err(job)` when stopped, and `Ok(polling)` otherwise, where
    /// `polling` tells the caller to interrupt the reactor.
    pub(crate) fn push(&self, job: Job) -> Result<bool, Job> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(job);
        }

        state.jobs.push_back(job);
        let polling = state.polling;
        drop(state);

        self.cond.notify_one();
        Ok(polling)
    }

    /// Marks the queue stopped and releases every parked worker.
    ///
    /// Returns whether a worker is blocked in the reactor.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.state.lock();
        state.stopped = true;
        let polling = state.polling;
        drop(state);

        self.cond.notify_all();
        polling
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, QueueState>) {
        self.cond.wait(state);
    }

    pub(crate) fn notify_one(&self) {
        self.cond.notify_one();
    }
}
