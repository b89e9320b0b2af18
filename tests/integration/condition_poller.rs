use std::cell::Cell;
use std::time::{Duration, Instant};

use paratask::{ConditionPoller, PollError, PollStatus};

/// Predicate is false for calls 1-3 and true on call 4
#[test]
fn test_counter_predicate_converges_on_fourth_call() {
    let calls = Cell::new(0u32);
    let poller = ConditionPoller::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();

    let started = Instant::now();
    let reached = poller
        .poll_true(|| {
            calls.set(calls.get() + 1);
            Ok::<_, anyhow::Error>(calls.get() == 4)
        })
        .unwrap();
    let elapsed = started.elapsed();

    assert!(reached);
    assert_eq!(calls.get(), 4);
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_millis(4500), "took {elapsed:?}");
}

/// Target on the k-th call returns after about interval * (k - 1)
#[test]
fn test_kth_call_elapsed_time() {
    let interval = Duration::from_millis(100);
    let poller = ConditionPoller::new(Duration::from_secs(5), interval).unwrap();

    for k in [1u32, 2, 5] {
        let calls = Cell::new(0u32);
        let report = poller
            .poll_report(&k, || {
                calls.set(calls.get() + 1);
                Ok::<_, anyhow::Error>(calls.get())
            })
            .unwrap();

        let floor = interval * (k - 1);
        assert_eq!(report.status, PollStatus::Succeeded);
        assert_eq!(report.attempts, k);
        assert_eq!(report.last_value, k);
        assert!(report.elapsed >= floor);
        assert!(
            report.elapsed < floor + Duration::from_millis(400),
            "k={k} took {:?}",
            report.elapsed
        );
    }
}

/// A predicate that never matches gives up near the timeout
#[test]
fn test_never_matching_predicate_times_out() {
    let timeout = Duration::from_millis(1000);
    let interval = Duration::from_millis(300);
    let poller = ConditionPoller::new(timeout, interval).unwrap();

    let calls = Cell::new(0u32);
    let started = Instant::now();
    let reached = poller
        .poll_true(|| {
            calls.set(calls.get() + 1);
            Ok::<_, anyhow::Error>(false)
        })
        .unwrap();
    let elapsed = started.elapsed();

    // slots at 0, 300, 600 and 900ms
    assert!(!reached);
    assert!(calls.get() >= 3 && calls.get() <= 4, "made {} calls", calls.get());
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
}

#[test]
fn test_short_timeouts_invoke_exactly_once() {
    for timeout in [Duration::ZERO, Duration::from_millis(50)] {
        let calls = Cell::new(0u32);
        let poller = ConditionPoller::new(timeout, Duration::from_millis(200)).unwrap();

        let report = poller
            .poll_report(&"Up", || {
                calls.set(calls.get() + 1);
                Ok::<_, anyhow::Error>("Down")
            })
            .unwrap();

        assert_eq!(report.status, PollStatus::TimedOut);
        assert_eq!(report.attempts, 1);
        assert_eq!(calls.get(), 1);
    }
}

#[test]
fn test_raising_predicate_is_fatal() {
    let calls = Cell::new(0u32);
    let poller = ConditionPoller::new(Duration::from_secs(10), Duration::from_millis(50)).unwrap();

    let started = Instant::now();
    let err = poller
        .poll_true(|| {
            calls.set(calls.get() + 1);
            Err::<bool, _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "engine unreachable",
            ))
        })
        .unwrap_err();

    assert_eq!(calls.get(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, PollError::Predicate { attempts: 1, .. }));
    assert_eq!(
        err.to_string(),
        "Predicate failed on attempt 1: engine unreachable"
    );
}

/// Pollers embedded in group tasks poll concurrently
#[test]
fn test_concurrent_polling_inside_task_group() {
    use paratask::TaskGroup;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let mut group: TaskGroup<bool> = TaskGroup::with_name("convergence");
    for _ in 0..4 {
        let counter = Arc::new(AtomicU32::new(0));
        group
            .add_check(move || {
                let poller =
                    ConditionPoller::new(Duration::from_secs(2), Duration::from_millis(100))?;
                let reached = poller.poll_true(|| {
                    Ok::<_, anyhow::Error>(counter.fetch_add(1, Ordering::SeqCst) >= 3)
                })?;
                Ok::<_, anyhow::Error>(reached)
            })
            .unwrap();
    }

    let started = Instant::now();
    let result = group.run_and_wait(Duration::from_secs(5)).unwrap();

    assert!(result.overall_success);
    assert!(started.elapsed() < Duration::from_millis(1000));
}
