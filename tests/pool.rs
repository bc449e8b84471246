use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use script_pool::{Pool, PoolConfig, PoolError};

fn small_pool(threads: usize) -> Pool {
    let _ = env_logger::try_init();
    Pool::new(PoolConfig {
        initial_threads: threads,
        min_threads: threads,
        max_threads: threads,
        ..PoolConfig::default()
    })
    .expect("pool should start with a valid config")
}

#[test]
fn basic_dispatch_completes() {
    let pool = small_pool(2);
    let (tx, rx) = mpsc::channel();
    pool.submit_source(
        b"1 + 1".to_vec(),
        Box::new(move |id| {
            let _ = tx.send(id);
        }),
    )
    .expect("submission should be accepted");

    rx.recv_timeout(Duration::from_secs(5))
        .expect("task should complete and invoke its callback");
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn timer_delays_completion() {
    let pool = small_pool(2);
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    pool.submit_source(
        b"setTimeout(function () {}, 50);".to_vec(),
        Box::new(move |_| {
            let _ = tx.send(());
        }),
    )
    .expect("submission should be accepted");

    rx.recv_timeout(Duration::from_secs(5))
        .expect("timer task should eventually complete");
    assert!(
        start.elapsed() >= Duration::from_millis(40),
        "completion should not fire before the armed timer is due"
    );
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn interval_cancelled_allows_context_teardown() {
    let pool = small_pool(2);
    let (tx, rx) = mpsc::channel();
    let script = b"\
        var id = setInterval(function () {}, 10);\
        setTimeout(function () { clearInterval(id); }, 30);\
    "
    .to_vec();
    pool.submit_source(
        script,
        Box::new(move |_| {
            let _ = tx.send(());
        }),
    )
    .expect("submission should be accepted");

    rx.recv_timeout(Duration::from_secs(5))
        .expect("clearing the interval should let the context finish tearing down");
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn empty_payload_is_refused() {
    let pool = small_pool(1);
    let result = pool.submit_source(Vec::new(), Box::new(|_| {}));
    assert!(matches!(result, Err(PoolError::SubmissionRefused(_))));
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn empty_bytecode_is_refused() {
    let pool = small_pool(1);
    let result = pool.submit_bytecode(Vec::new(), Box::new(|_| {}));
    assert!(matches!(result, Err(PoolError::SubmissionRefused(_))));
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn back_pressure_rejects_when_queue_full() {
    let pool = Pool::new(PoolConfig {
        initial_threads: 1,
        min_threads: 1,
        max_threads: 1,
        global_queue_capacity: 1,
        local_queue_capacity: 1,
        ..PoolConfig::default()
    })
    .unwrap();

    let (tx, rx) = mpsc::channel();
    pool.submit_source(
        b"setTimeout(function () {}, 200);".to_vec(),
        Box::new(move |_| {
            let _ = tx.send(());
        }),
    )
    .expect("first submission keeps the lone worker busy");
    pool.submit_source(b"1".to_vec(), Box::new(|_| {}))
        .expect("second submission should fill the one-slot global queue");

    let result = pool.submit_source(b"1".to_vec(), Box::new(|_| {}));
    assert!(
        matches!(result, Err(PoolError::SubmissionRefused(_))),
        "a third submission against a full queue should be refused"
    );

    let _ = rx.recv_timeout(Duration::from_secs(5));
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn many_tasks_all_complete_with_multiple_workers() {
    let pool = small_pool(4);
    let remaining = Arc::new(AtomicUsize::new(200));
    let (tx, rx) = mpsc::channel();

    for _ in 0..200 {
        let remaining = remaining.clone();
        let tx = tx.clone();
        pool.submit_source(
            b"1 + 1".to_vec(),
            Box::new(move |_| {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = tx.send(());
                }
            }),
        )
        .expect("submission should be accepted");
    }

    rx.recv_timeout(Duration::from_secs(10))
        .expect("every submitted task should eventually complete");
    assert_eq!(remaining.load(Ordering::SeqCst), 0);
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn shutdown_when_idle_returns_promptly() {
    let pool = small_pool(2);
    let start = Instant::now();
    pool.shutdown(Duration::from_secs(5));
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "an idle pool should shut down without waiting out the drain timeout"
    );
}

#[test]
fn submit_after_shutdown_is_refused() {
    let pool = small_pool(1);
    pool.shutdown(Duration::from_secs(5));
    let result = pool.submit_source(b"1".to_vec(), Box::new(|_| {}));
    assert!(matches!(result, Err(PoolError::ShuttingDown)));
}

#[test]
fn work_spreads_past_the_first_worker() {
    let pool = small_pool(4);
    let (tx, rx) = mpsc::channel();
    let remaining = Arc::new(AtomicUsize::new(80));

    for _ in 0..80 {
        let remaining = remaining.clone();
        let tx = tx.clone();
        pool.submit_source(
            b"1 + 1".to_vec(),
            Box::new(move |_| {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = tx.send(());
                }
            }),
        )
        .expect("submission should be accepted");
    }

    rx.recv_timeout(Duration::from_secs(10))
        .expect("every submitted task should eventually complete");

    let processed_by_other_workers: u64 = (1..4)
        .map(|id| {
            pool.thread_stats(id)
                .expect("worker thread should exist")
                .tasks_processed
        })
        .sum();
    assert!(
        processed_by_other_workers > 0,
        "round-robin affinity and work-stealing should spread tasks past worker 0"
    );
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn resize_grows_and_shrinks_the_pool() {
    let pool = Pool::new(PoolConfig {
        initial_threads: 1,
        min_threads: 1,
        max_threads: 4,
        ..PoolConfig::default()
    })
    .unwrap();

    pool.resize(4).expect("growing within bounds should succeed");
    assert_eq!(pool.stats().active_threads + pool.stats().idle_threads, 4);

    pool.resize(1).expect("shrinking within bounds should succeed");
    assert_eq!(pool.stats().active_threads + pool.stats().idle_threads, 1);

    pool.shutdown(Duration::from_secs(5));
}
