mod common;

use netcore::{BoundedQueue, PushStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn never_exceeds_capacity_under_contention() {
    common::init_tracing();
    let queue = Arc::new(BoundedQueue::new(8));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = queue.clone();
            let max_seen = max_seen.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let strategy = match i % 3 {
                        0 => PushStrategy::Wait,
                        1 => PushStrategy::DropOldest,
                        _ => PushStrategy::DropCurrent,
                    };
                    queue.push(p * 1000 + i, strategy);
                    max_seen.fetch_max(queue.len(), Ordering::Relaxed);
                }
            })
        })
        .collect();

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut popped = 0;
            while queue.wait_pop(Duration::from_millis(200)).is_some() {
                popped += 1;
            }
            popped
        })
    };

    for producer in producers {
        producer.join().expect("producer");
    }
    assert!(consumer.join().expect("consumer") > 0);
    assert!(max_seen.load(Ordering::Relaxed) <= 8);
}

#[test]
fn drop_oldest_evicts_exactly_the_oldest_once() {
    let dropped = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = dropped.clone();
    let queue = BoundedQueue::with_drop_callback(3, move |value| sink.lock().push(value));

    for value in 0..4 {
        assert!(queue.push(value, PushStrategy::DropOldest));
    }

    assert_eq!(queue.len(), 3);
    assert_eq!(*dropped.lock(), vec![0]);
    assert_eq!(queue.try_pop(), Some(1));
}

#[test]
fn concurrent_drop_oldest_accounts_for_every_value() {
    let evicted = Arc::new(AtomicUsize::new(0));
    let counter = evicted.clone();
    let queue = Arc::new(BoundedQueue::with_drop_callback(4, move |_: usize| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    assert!(queue.push(p * 1000 + i, PushStrategy::DropOldest));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    assert_eq!(queue.len(), 4);
    assert_eq!(evicted.load(Ordering::Relaxed), 8000 - 4);
}

#[test]
fn stop_releases_waiters_and_rejects_new_work() {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
    assert!(queue.push(1, PushStrategy::Wait));

    let blocked_producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.push(2, PushStrategy::Wait))
    };
    thread::sleep(Duration::from_millis(20));
    queue.stop();

    assert!(!blocked_producer.join().expect("producer"));
    assert!(!queue.push(3, PushStrategy::DropOldest));

    let started = Instant::now();
    assert_eq!(queue.wait_pop(Duration::ZERO), None);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn wait_pop_times_out_on_empty_queue() {
    let queue: BoundedQueue<u8> = BoundedQueue::new(2);
    let started = Instant::now();
    assert_eq!(queue.wait_pop(Duration::from_millis(30)), None);
    assert!(started.elapsed() >= Duration::from_millis(30));
}
