mod common;

use netcore::time::{sleep, timeout};
use netcore::{Diagnose, DiagnoseHook, Error, Executor, ExecutorConfig, Task, TaskState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn join_never_misses_a_finish() {
    common::init_tracing();
    let executor = Arc::new(Executor::new("stress", 4).expect("executor"));
    let counter = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let executor = executor.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    let counter = counter.clone();
                    let task = Task::new(format!("t{p}-{i}"), move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                    executor.post_task(&task).expect("post");
                    task.join().expect("join");
                    assert_eq!(task.state(), TaskState::Finished);
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer thread");
    }
    assert_eq!(counter.load(Ordering::Relaxed), 2000);
    executor.join().expect("join executor");
}

#[test]
fn posting_to_a_stopped_executor_fails() {
    let executor = Executor::new("stopped", 1).expect("executor");
    executor.stop();

    let task = Task::new("late", |_| {});
    let err = executor.post_task(&task).unwrap_err();
    assert!(matches!(err, Error::ExecutorStopped(ref name) if name == "stopped"));
    assert_eq!(task.state(), TaskState::Created);
    executor.join().expect("join");
}

#[test]
fn cancellation_is_cooperative() {
    let executor = Executor::new("cancel", 1).expect("executor");
    let observed = Arc::new(AtomicUsize::new(0));

    let seen = observed.clone();
    let task = Task::new("loop", move |task| {
        while !task.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        seen.store(1, Ordering::Release);
    });
    executor.post_task(&task).expect("post");

    assert!(common::wait_until(Duration::from_secs(2), || task.state() == TaskState::Running));
    task.cancel();
    assert!(task.join_timeout(Duration::from_secs(2)));
    assert_eq!(observed.load(Ordering::Acquire), 1);
}

#[derive(Default)]
struct CountingHook {
    finished: AtomicUsize,
    exceptions: AtomicUsize,
}

impl DiagnoseHook for CountingHook {
    fn on_task_finished(&self, _: &str, _: &str, _: &str, _: Duration) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_exception(&self, _: &str, _: &str, _: &str, _: &str) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn panics_surface_only_through_diagnose() {
    common::init_tracing();
    let diagnose = Diagnose::new();
    let hook = Arc::new(CountingHook::default());
    diagnose.set_hook(hook.clone());

    let executor =
        Executor::with_config(ExecutorConfig::new("diag", 2).with_diagnose(diagnose.clone()))
            .expect("executor");

    executor.post("ok", || {}).expect("post").join().expect("join");
    executor
        .post("boom", || panic!("task exploded"))
        .expect("post")
        .join()
        .expect("join");
    // The executor keeps working after a panic.
    executor.post("after", || {}).expect("post").join().expect("join");

    assert_eq!(hook.finished.load(Ordering::Relaxed), 2);
    assert_eq!(hook.exceptions.load(Ordering::Relaxed), 1);

    let snapshot = diagnose.snapshot();
    let record = snapshot
        .executors
        .iter()
        .find(|e| e.name == "diag")
        .expect("executor record");
    assert_eq!(record.tasks_failed, 1);
    let exception = record.last_exception.as_ref().expect("exception recorded");
    assert_eq!(exception.task_name, "boom");
    assert!(exception.message.contains("task exploded"));
    assert!(diagnose.to_json().contains("\"diag\""));
}

#[test]
fn isolated_diagnose_contexts_do_not_share_state() {
    let first = Diagnose::new();
    let second = Diagnose::new();
    let executor =
        Executor::with_config(ExecutorConfig::new("isolated", 1).with_diagnose(first.clone()))
            .expect("executor");

    executor.post("x", || {}).expect("post").join().expect("join");

    assert_eq!(first.snapshot().executors.len(), 1);
    assert!(second.snapshot().executors.is_empty());
}

#[test]
fn spawned_futures_can_sleep_and_time_out() {
    let executor = Executor::new("futures", 2).expect("executor");

    let started = Instant::now();
    let slept = executor.spawn(async {
        sleep(Duration::from_millis(30)).await;
        7
    });
    assert_eq!(slept.join().expect("spawned"), 7);
    assert!(started.elapsed() >= Duration::from_millis(30));

    let expired = executor
        .block_on(timeout(Duration::from_millis(20), sleep(Duration::from_secs(5))))
        .expect("block_on");
    assert!(expired.unwrap_err().is_timeout());
}

#[test]
fn block_on_from_a_worker_would_deadlock() {
    let executor = Executor::new("nested", 1).expect("executor");
    let handle = executor.handle().clone();

    let result = Arc::new(parking_lot::Mutex::new(None));

    let slot = result.clone();
    executor
        .post("nested", move || {
            *slot.lock() = Some(matches!(handle.block_on(async {}), Err(Error::WouldDeadlock)));
        })
        .expect("post")
        .join()
        .expect("join");

    assert_eq!(*result.lock(), Some(true));
}
