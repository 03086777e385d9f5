//! Named worker pools driven by one shared reactor.
//!
//! Every worker runs the same loop: take a job from the run queue, or,
//! if the queue is empty and nobody else is polling, block in the reactor
//! until I/O, a timer or a new job arrives. Other idle workers park on the
//! queue's condition variable.

use crate::config::ExecutorConfig;
use crate::diagnose::Diagnose;
use crate::error::{Error, Result, panic_message};
use crate::reactor::Reactor;
use crate::runtime::context::{current_handle, enter_context};
use crate::runtime::queue::{Job, RunQueue};
use crate::runtime::spawn::{JoinHandle, Runnable, Spawned};
use crate::runtime::task::Task;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Shared {
    id: u64,
    name: String,
    reactor: Arc<Reactor>,
    queue: RunQueue,
    diagnose: Option<Arc<Diagnose>>,
    workers: Mutex<Vec<ThreadId>>,
    spawned: Mutex<HashMap<u64, Weak<dyn Runnable>>>,
    next_spawn: AtomicU64,
}

impl Shared {
    /// Enqueues `job`. Returns `false` once the executor is stopped.
    pub(crate) fn schedule(&self, job: Job) -> bool {
        match self.queue.push(job) {
            Ok(polling) => {
                if polling {
                    self.reactor.wake();
                }
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn forget_spawned(&self, id: u64) {
        self.spawned.lock().remove(&id);
    }

    fn is_worker(&self) -> bool {
        let current = thread::current().id();
        self.workers.lock().contains(&current)
    }

    fn run_job(&self, job: Job, stopped: bool) {
        match job {
            Job::Task(task) => self.run_task(task),
            // Pending futures are abandoned, not polled, once stopped.
            Job::Poll(_) if stopped => {}
            Job::Poll(runnable) => runnable.run(),
            Job::Call(_) if stopped => {}
            Job::Call(call) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
                    error!(
                        executor = %self.name,
                        panic = %panic_message(payload.as_ref()),
                        "timer callback panicked"
                    );
                }
            }
        }
    }

    fn run_task(&self, task: Arc<Task>) {
        let Some(func) = task.take_func() else {
            task.mark_finished();
            return;
        };

        task.mark_running();
        if let Some(diagnose) = &self.diagnose {
            diagnose.task_running(self.id, &task);
        }

        match catch_unwind(AssertUnwindSafe(|| func(&*task))) {
            Ok(()) => {
                if let Some(diagnose) = &self.diagnose {
                    diagnose.task_finished(self.id, &task);
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    executor = %self.name,
                    task = %task.name(),
                    panic = %message,
                    "task panicked"
                );
                if let Some(diagnose) = &self.diagnose {
                    diagnose.task_exception(self.id, &task, &message);
                }
            }
        }

        task.mark_finished();
    }

    fn worker_loop(self: &Arc<Self>) {
        let handle = Handle {
            shared: self.clone(),
        };

        enter_context(self.reactor.clone(), Some(handle), || {
            let mut state = self.queue.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    let stopped = state.stopped;
                    drop(state);
                    self.run_job(job, stopped);
                    state = self.queue.lock();
                    continue;
                }

                if state.stopped {
                    break;
                }

                if state.polling {
                    self.queue.wait(&mut state);
                    continue;
                }

                state.polling = true;
                drop(state);

                let calls = self.reactor.turn(None).unwrap_or_else(|err| {
                    error!(executor = %self.name, error = %err, "reactor turn failed");
                    Vec::new()
                });

                state = self.queue.lock();
                state.polling = false;
                if !state.stopped {
                    state.jobs.extend(calls.into_iter().map(Job::Call));
                }

                // Let a parked worker take over polling while this one runs jobs.
                if !state.jobs.is_empty() {
                    self.queue.notify_one();
                }
            }
        });

        trace!(executor = %self.name, "worker exiting");
    }

    fn stop(&self) {
        if self.queue.stop() {
            self.reactor.wake();
        }
    }

    /// Resolves every spawned future that never completed.
    fn abandon_spawned(&self) {
        self.queue.lock().jobs.clear();

        let spawned: Vec<_> = self.spawned.lock().drain().map(|(_, weak)| weak).collect();
        let mut aborted = 0;
        for runnable in spawned.into_iter().filter_map(|weak| weak.upgrade()) {
            runnable.abort();
            aborted += 1;
        }

        // Sleeping futures hold the reactor through their wakers.
        self.reactor.clear_timers();

        if aborted > 0 {
            debug!(executor = %self.name, aborted, "abandoned pending futures");
        }
    }
}

/// Cheap, cloneable reference to an executor.
///
/// A handle stays usable after the [`Executor`] is dropped; submissions then
/// fail with [`Error::ExecutorStopped`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The executor whose worker thread, or `block_on` call, is current.
    pub fn current() -> Option<Handle> {
        current_handle()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_stopped()
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.shared.reactor
    }

    /// Wraps `func` in a new [`Task`] named `name` and posts it.
    ///
    /// # Example
    /// ```no_run
    /// use netcore::Executor;
    ///
    /// let executor = Executor::new("io", 2)?;
    /// let task = executor.post("hello", || println!("hello from a worker"))?;
    /// task.join()?;
    /// # Ok::<(), netcore::Error>(())
    /// ```
    pub fn post<F>(&self, name: impl Into<String>, func: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new(name, move |_| func());
        self.post_task(&task)?;
        Ok(task)
    }

    /// Queues `task` for execution: `Created -> Queuing`.
    ///
    /// Fails with [`Error::ExecutorStopped`] after [`Executor::stop`], leaving
    /// the task in `Created`, and with [`Error::InvalidState`] if the task was
    /// posted before.
    pub fn post_task(&self, task: &Arc<Task>) -> Result<()> {
        let shared = &self.shared;
        if shared.queue.is_stopped() {
            return Err(Error::ExecutorStopped(shared.name.clone()));
        }

        task.mark_queuing()?;
        if let Some(diagnose) = &shared.diagnose {
            diagnose.task_bound(shared.id, task);
        }

        if !shared.schedule(Job::Task(task.clone())) {
            if let Some(diagnose) = &shared.diagnose {
                diagnose.task_unbound(shared.id, task.id());
            }
            task.unmark_queuing();
            return Err(Error::ExecutorStopped(shared.name.clone()));
        }

        Ok(())
    }

    /// Runs `future` on the executor's workers.
    ///
    /// On a stopped executor the handle resolves to
    /// [`Error::ExecutorStopped`] without polling the future.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = &self.shared;
        let id = shared.next_spawn.fetch_add(1, Ordering::Relaxed);
        let (spawned, handle) = Spawned::new(id, Arc::downgrade(shared), future);

        let runnable: Arc<dyn Runnable> = spawned.clone();
        shared.spawned.lock().insert(id, Arc::downgrade(&runnable));

        if !shared.schedule(Job::Poll(runnable)) {
            shared.forget_spawned(id);
            spawned.reject(Error::ExecutorStopped(shared.name.clone()));
        }

        handle
    }

    /// Drives `future` to completion on the calling thread while the
    /// executor's workers run its I/O and timers.
    ///
    /// Fails with [`Error::WouldDeadlock`] on one of the executor's own
    /// workers.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        if self.shared.is_worker() {
            return Err(Error::WouldDeadlock);
        }
        if self.is_stopped() {
            return Err(Error::ExecutorStopped(self.shared.name.clone()));
        }

        Ok(enter_context(
            self.shared.reactor.clone(),
            Some(self.clone()),
            || futures::executor::block_on(future),
        ))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.shared.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A named pool of worker threads sharing one reactor.
///
/// Dropping the executor joins it.
///
/// # Example
/// ```no_run
/// use netcore::Executor;
///
/// let executor = Executor::new("pool", 4)?;
/// let sum = executor.spawn(async { (1..=10).sum::<u32>() }).join()?;
/// assert_eq!(sum, 55);
/// executor.join()?;
/// # Ok::<(), netcore::Error>(())
/// ```
pub struct Executor {
    handle: Handle,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    joined: AtomicBool,
}

impl Executor {
    /// Starts `threads` workers named `"{name}-{index}"`.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        Self::with_config(ExecutorConfig::new(name, threads))
    }

    pub fn with_config(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            name: config.name.clone(),
            reactor: Arc::new(Reactor::new()?),
            queue: RunQueue::new(),
            diagnose: config.diagnose.clone(),
            workers: Mutex::new(Vec::with_capacity(config.threads)),
            spawned: Mutex::new(HashMap::new()),
            next_spawn: AtomicU64::new(1),
        });

        if let Some(diagnose) = &shared.diagnose {
            diagnose.executor_created(shared.id, &shared.name, config.threads);
        }

        let executor = Executor {
            handle: Handle {
                shared: shared.clone(),
            },
            threads: Mutex::new(Vec::with_capacity(config.threads)),
            joined: AtomicBool::new(false),
        };

        for index in 0..config.threads {
            let worker = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker.worker_loop());

            match spawned {
                Ok(thread) => {
                    shared.workers.lock().push(thread.thread().id());
                    executor.threads.lock().push(thread);
                }
                // Dropping `executor` joins the workers already started.
                Err(err) => return Err(Error::Io(err)),
            }
        }

        debug!(executor = %config.name, threads = config.threads, "executor started");
        Ok(executor)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.handle.shared.workers.lock().len()
    }

    pub fn post<F>(&self, name: impl Into<String>, func: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.post(name, func)
    }

    pub fn post_task(&self, task: &Arc<Task>) -> Result<()> {
        self.handle.post_task(task)
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        self.handle.block_on(future)
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// Refuses new work and wakes every worker. Queued closure tasks still
    /// run; call [`Executor::join`] to wait for them.
    pub fn stop(&self) {
        self.handle.shared.stop();
    }

    /// Stops the executor, runs the closure tasks already queued, abandons
    /// pending futures and joins the workers.
    ///
    /// On one of the executor's own workers this only stops it and returns
    /// [`Error::WouldDeadlock`].
    pub fn join(&self) -> Result<()> {
        let shared = &self.handle.shared;
        shared.stop();

        if shared.is_worker() {
            return Err(Error::WouldDeadlock);
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                error!(executor = %shared.name, "worker thread panicked");
            }
        }

        if !self.joined.swap(true, Ordering::AcqRel) {
            shared.abandon_spawned();
            if let Some(diagnose) = &shared.diagnose {
                diagnose.executor_destroyed(shared.id);
            }
            debug!(executor = %shared.name, "executor stopped");
        }

        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            trace!(executor = %self.name(), error = %err, "executor dropped on its own worker");
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name())
            .field("threads", &self.threads())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
