//! Task and executor lifecycle diagnostics.
//!
//! A [`Diagnose`] is a passive observer: executors created with it report
//! when tasks are bound, start, finish or panic, and it keeps a record of
//! every live task plus per-executor counters. It never influences
//! scheduling, and panics raised by a registered [`DiagnoseHook`] are
//! logged and swallowed.
//!
//! ```no_run
//! use netcore::{Diagnose, Executor, ExecutorConfig};
//!
//! let diagnose = Diagnose::new();
//! let executor = Executor::with_config(
//!     ExecutorConfig::new("io", 2).with_diagnose(diagnose.clone()),
//! )?;
//! executor.post("work", || {})?.join()?;
//! println!("{}", diagnose.report());
//! # Ok::<(), netcore::Error>(())
//! ```

use crate::runtime::task::{Task, TaskState};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Observer notified on task lifecycle events.
///
/// Every method has an empty default. Hooks run on the worker thread that
/// produced the event, outside the registry lock.
#[allow(unused_variables)]
pub trait DiagnoseHook: Send + Sync {
    /// A task was posted; `task_count` is the executor's number of live tasks.
    fn on_task_bound(&self, executor: &str, task_count: usize, task_id: u64, task_name: &str) {}

    /// A task started after waiting `queued_for`.
    fn on_task_running(&self, executor: &str, thread: &str, task_name: &str, queued_for: Duration) {
    }

    /// A task returned normally after running for `ran_for`.
    fn on_task_finished(&self, executor: &str, thread: &str, task_name: &str, ran_for: Duration) {}

    /// A task panicked with `message`.
    fn on_task_exception(&self, executor: &str, thread: &str, task_name: &str, message: &str) {}
}

struct TaskRecord {
    task: Weak<Task>,
    name: String,
    queued_at: Instant,
    running_at: Option<Instant>,
    thread: Option<String>,
}

struct ExceptionRecord {
    task_id: u64,
    task_name: String,
    thread: String,
    message: String,
}

struct ExecutorRecord {
    name: String,
    threads: usize,
    tasks: BTreeMap<u64, TaskRecord>,
    bound: u64,
    finished: u64,
    failed: u64,
    last_exception: Option<ExceptionRecord>,
}

/// Shared diagnostics context. Create one per test or per process and
/// inject it through [`crate::ExecutorConfig::with_diagnose`].
pub struct Diagnose {
    executors: Mutex<BTreeMap<u64, ExecutorRecord>>,
    hook: RwLock<Option<Arc<dyn DiagnoseHook>>>,
}

/// Point-in-time copy of one live task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub name: String,
    pub thread: Option<String>,
    pub state: TaskState,
    /// Time spent queued, up to now if still queued.
    #[serde(serialize_with = "serialize_duration")]
    pub queue: Duration,
    /// Time spent running so far.
    #[serde(serialize_with = "serialize_optional_duration")]
    pub run: Option<Duration>,
}

/// The most recent panic raised by a task of one executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionSnapshot {
    pub task_id: u64,
    pub task_name: String,
    pub thread: String,
    pub message: String,
}

/// Point-in-time copy of one executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorSnapshot {
    pub name: String,
    pub threads: usize,
    /// Live (queued or running) tasks.
    pub count: usize,
    pub tasks_bound: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    pub tasks: Vec<TaskSnapshot>,
    pub last_exception: Option<ExceptionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnoseSnapshot {
    pub executors: Vec<ExecutorSnapshot>,
}

impl Diagnose {
    pub fn new() -> Arc<Diagnose> {
        Arc::new(Diagnose {
            executors: Mutex::new(BTreeMap::new()),
            hook: RwLock::new(None),
        })
    }

    /// Installs `hook`, replacing any previous one.
    pub fn set_hook(&self, hook: Arc<dyn DiagnoseHook>) {
        *self.hook.write() = Some(hook);
    }

    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    pub(crate) fn executor_created(&self, executor: u64, name: &str, threads: usize) {
        self.executors
            .lock()
            .entry(executor)
            .or_insert_with(|| ExecutorRecord {
                name: name.to_string(),
                threads,
                tasks: BTreeMap::new(),
                bound: 0,
                finished: 0,
                failed: 0,
                last_exception: None,
            });
    }

    pub(crate) fn executor_destroyed(&self, executor: u64) {
        self.executors.lock().remove(&executor);
    }

    pub(crate) fn task_bound(&self, executor: u64, task: &Arc<Task>) {
        let event = {
            let mut executors = self.executors.lock();
            let Some(record) = executors.get_mut(&executor) else {
                return;
            };
            if record.tasks.contains_key(&task.id()) {
                return;
            }

            record.tasks.insert(
                task.id(),
                TaskRecord {
                    task: Arc::downgrade(task),
                    name: task.name().to_string(),
                    queued_at: Instant::now(),
                    running_at: None,
                    thread: None,
                },
            );
            record.bound += 1;
            (record.name.clone(), record.tasks.len())
        };

        self.notify(|hook| hook.on_task_bound(&event.0, event.1, task.id(), task.name()));
    }

    /// Drops the record of a task the executor refused after binding it.
    pub(crate) fn task_unbound(&self, executor: u64, task_id: u64) {
        if let Some(record) = self.executors.lock().get_mut(&executor) {
            if record.tasks.remove(&task_id).is_some() {
                record.bound = record.bound.saturating_sub(1);
            }
        }
    }

    pub(crate) fn task_running(&self, executor: u64, task: &Task) {
        let thread = current_thread_name();
        let event = {
            let mut executors = self.executors.lock();
            let Some(record) = executors.get_mut(&executor) else {
                return;
            };
            let Some(info) = record.tasks.get_mut(&task.id()) else {
                return;
            };

            let now = Instant::now();
            info.running_at = Some(now);
            info.thread = Some(thread.clone());
            (record.name.clone(), now - info.queued_at)
        };

        self.notify(|hook| hook.on_task_running(&event.0, &thread, task.name(), event.1));
    }

    pub(crate) fn task_finished(&self, executor: u64, task: &Task) {
        let thread = current_thread_name();
        let event = {
            let mut executors = self.executors.lock();
            let Some(record) = executors.get_mut(&executor) else {
                return;
            };
            let Some(info) = record.tasks.remove(&task.id()) else {
                return;
            };

            record.finished += 1;
            let ran_for = info.running_at.map(|at| at.elapsed()).unwrap_or_default();
            (record.name.clone(), ran_for)
        };

        self.notify(|hook| hook.on_task_finished(&event.0, &thread, task.name(), event.1));
    }

    pub(crate) fn task_exception(&self, executor: u64, task: &Task, message: &str) {
        let thread = current_thread_name();
        let name = {
            let mut executors = self.executors.lock();
            let Some(record) = executors.get_mut(&executor) else {
                return;
            };
            if record.tasks.remove(&task.id()).is_none() {
                return;
            }

            record.failed += 1;
            record.last_exception = Some(ExceptionRecord {
                task_id: task.id(),
                task_name: task.name().to_string(),
                thread: thread.clone(),
                message: message.to_string(),
            });
            record.name.clone()
        };

        self.notify(|hook| hook.on_task_exception(&name, &thread, task.name(), message));
    }

    fn notify(&self, event: impl FnOnce(&dyn DiagnoseHook)) {
        let Some(hook) = self.hook.read().clone() else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| event(hook.as_ref()))).is_err() {
            warn!("diagnose hook panicked");
        }
    }

    /// Copies the current registry.
    pub fn snapshot(&self) -> DiagnoseSnapshot {
        let now = Instant::now();
        let executors = self.executors.lock();

        let executors = executors
            .values()
            .map(|record| ExecutorSnapshot {
                name: record.name.clone(),
                threads: record.threads,
                count: record.tasks.len(),
                tasks_bound: record.bound,
                tasks_finished: record.finished,
                tasks_failed: record.failed,
                tasks: record
                    .tasks
                    .iter()
                    .map(|(id, info)| TaskSnapshot {
                        id: *id,
                        name: info.name.clone(),
                        thread: info.thread.clone(),
                        state: info
                            .task
                            .upgrade()
                            .map(|task| task.state())
                            .unwrap_or(TaskState::Finished),
                        queue: info.running_at.unwrap_or(now) - info.queued_at,
                        run: info.running_at.map(|at| now - at),
                    })
                    .collect(),
                last_exception: record.last_exception.as_ref().map(|e| ExceptionSnapshot {
                    task_id: e.task_id,
                    task_name: e.task_name.clone(),
                    thread: e.thread.clone(),
                    message: e.message.clone(),
                }),
            })
            .collect();

        DiagnoseSnapshot { executors }
    }

    /// Human-readable report of every live task, grouped by executor.
    pub fn report(&self) -> String {
        self.snapshot().to_string()
    }

    /// The snapshot as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|err| {
            warn!(error = %err, "diagnose snapshot serialization failed");
            String::from("{}")
        })
    }
}

impl fmt::Debug for Diagnose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnose")
            .field("executors", &self.executors.lock().len())
            .field("hook", &self.hook.read().is_some())
            .finish()
    }
}

impl fmt::Display for DiagnoseSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for executor in &self.executors {
            writeln!(
                f,
                "Executor [{}] tasks: bound {}, finished {}, failed {}",
                executor.name, executor.tasks_bound, executor.tasks_finished, executor.tasks_failed
            )?;

            for task in &executor.tasks {
                write!(f, "    Task [{}]", task.name)?;
                if let Some(thread) = &task.thread {
                    write!(f, ", thread [{thread}]")?;
                }
                write!(
                    f,
                    ", current state [{}], queue for [{}]",
                    task.state,
                    format_duration(task.queue)
                )?;
                if let Some(run) = task.run {
                    write!(f, ", run for [{}]", format_duration(run))?;
                }
                writeln!(f)?;
            }

            if let Some(e) = &executor.last_exception {
                writeln!(
                    f,
                    "    Last exception: task [{}], thread [{}]: {}",
                    e.task_name, e.thread, e.message
                )?;
            }
        }
        Ok(())
    }
}

/// Renders `duration` as whole `ns` below a microsecond, `us` below a
/// millisecond and `ms` otherwise.
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_micros(1) {
        format!("{} ns", duration.as_nanos())
    } else if duration < Duration::from_millis(1) {
        format!("{} us", duration.as_micros())
    } else {
        format!("{} ms", duration.as_millis())
    }
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

fn serialize_optional_duration<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_str(&format_duration(*d)),
        None => s.serialize_none(),
    }
}

fn current_thread_name() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_the_coarsest_unit_below_one() {
        assert_eq!(format_duration(Duration::from_nanos(999)), "999 ns");
        assert_eq!(format_duration(Duration::from_nanos(1_500)), "1 us");
        assert_eq!(format_duration(Duration::from_micros(999)), "999 us");
        assert_eq!(format_duration(Duration::from_millis(1_250)), "1250 ms");
    }

    #[test]
    fn records_follow_task_lifecycle() {
        let diagnose = Diagnose::new();
        diagnose.executor_created(1, "exec", 2);

        let task = Task::new("job", |_| {});
        diagnose.task_bound(1, &task);
        diagnose.task_bound(1, &task);

        let snapshot = diagnose.snapshot();
        assert_eq!(snapshot.executors[0].count, 1);
        assert_eq!(snapshot.executors[0].tasks_bound, 1);

        diagnose.task_running(1, &task);
        diagnose.task_finished(1, &task);

        let snapshot = diagnose.snapshot();
        assert_eq!(snapshot.executors[0].count, 0);
        assert_eq!(snapshot.executors[0].tasks_finished, 1);
    }

    #[test]
    fn unknown_executor_is_ignored() {
        let diagnose = Diagnose::new();
        let task = Task::new("orphan", |_| {});
        diagnose.task_bound(9, &task);
        diagnose.task_exception(9, &task, "boom");
        assert!(diagnose.snapshot().executors.is_empty());
    }

    #[test]
    fn panicking_hook_is_swallowed() {
        struct Bad;
        impl DiagnoseHook for Bad {
            fn on_task_bound(&self, _: &str, _: usize, _: u64, _: &str) {
                panic!("hook failure");
            }
        }

        let diagnose = Diagnose::new();
        diagnose.set_hook(Arc::new(Bad));
        diagnose.executor_created(1, "exec", 1);
        diagnose.task_bound(1, &Task::new("t", |_| {}));

        assert_eq!(diagnose.snapshot().executors[0].tasks_bound, 1);
    }

    #[test]
    fn json_contains_executor_and_task() {
        let diagnose = Diagnose::new();
        diagnose.executor_created(1, "json-exec", 1);
        let task = Task::new("pending", |_| {});
        diagnose.task_bound(1, &task);

        let value: serde_json::Value = serde_json::from_str(&diagnose.to_json()).unwrap();
        let executor = &value["executors"][0];
        assert_eq!(executor["name"], "json-exec");
        assert_eq!(executor["count"], 1);
        assert_eq!(executor["tasks"][0]["name"], "pending");
        assert_eq!(executor["tasks"][0]["state"], "Created");
    }
}
