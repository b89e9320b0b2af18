use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use paratask::{InvalidStateError, OutcomeStatus, TaskFailure, TaskGroup};

use super::after;

#[derive(Debug, thiserror::Error)]
#[error("ValueError: {0}")]
struct ValueError(String);

/// Tasks run concurrently: wall time tracks the slowest task, not the sum
#[test]
fn test_tasks_run_concurrently() {
    let mut group: TaskGroup<bool> = TaskGroup::with_name("concurrency");
    for _ in 0..8 {
        group
            .add_check(|| Ok::<_, anyhow::Error>(after(Duration::from_millis(300), true)))
            .unwrap();
    }

    let started = Instant::now();
    let result = group.run_and_wait(Duration::from_secs(10)).unwrap();
    let elapsed = started.elapsed();

    assert!(result.overall_success);
    assert_eq!(result.outcomes.len(), 8);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(
        elapsed < Duration::from_millis(1500),
        "8 x 300ms tasks took {elapsed:?}, expected them to overlap"
    );
}

#[test]
fn test_many_immediate_tasks_all_match() {
    for count in [0usize, 1, 5, 32] {
        let mut group: TaskGroup<bool> = TaskGroup::new();
        for _ in 0..count {
            group.add_check(|| Ok::<_, anyhow::Error>(true)).unwrap();
        }

        let result = group.run_and_wait(Duration::from_secs(5)).unwrap();
        assert!(result.overall_success, "group of {count} should succeed");
        assert_eq!(result.outcomes.len(), count);
        assert!(result
            .outcomes
            .iter()
            .enumerate()
            .all(|(index, outcome)| outcome.index == index));
    }
}

/// A slow task times out while its fast siblings keep their own outcome
#[test]
fn test_slow_task_times_out_without_affecting_siblings() {
    let mut group: TaskGroup<bool> = TaskGroup::new();
    group
        .add_named(
            "fast",
            || Ok::<_, anyhow::Error>(after(Duration::from_millis(50), true)),
            true,
        )
        .unwrap();
    group
        .add_named(
            "slow",
            || Ok::<_, anyhow::Error>(after(Duration::from_secs(3), true)),
            true,
        )
        .unwrap();
    group
        .add_named(
            "fast-mismatch",
            || Ok::<_, anyhow::Error>(after(Duration::from_millis(50), false)),
            true,
        )
        .unwrap();

    let started = Instant::now();
    let result = group.run_and_wait(Duration::from_millis(500)).unwrap();
    let elapsed = started.elapsed();

    assert!(!result.overall_success);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(2000));

    assert_eq!(result.outcomes[0].status(), OutcomeStatus::Matched);
    assert_eq!(result.outcomes[1].status(), OutcomeStatus::TimedOut);
    assert_eq!(result.outcomes[2].status(), OutcomeStatus::Mismatched);

    match result.outcomes[1].failure.as_ref().unwrap() {
        TaskFailure::Timeout(timeout) => assert_eq!(*timeout, Duration::from_millis(500)),
        other => panic!("Expected Timeout, got {other:?}"),
    }
    assert!(result.outcomes[1].returned.is_none());
}

/// Task A matches, B returns the wrong value, C raises ValueError
#[test]
fn test_mixed_outcomes_scenario() {
    let mut group: TaskGroup<bool> = TaskGroup::with_name("scenario");
    group
        .add_named(
            "A",
            || Ok::<_, anyhow::Error>(after(Duration::from_secs(1), true)),
            true,
        )
        .unwrap();
    group
        .add_named(
            "B",
            || Ok::<_, anyhow::Error>(after(Duration::from_secs(1), false)),
            true,
        )
        .unwrap();
    group
        .add_named(
            "C",
            || {
                after(Duration::from_secs(1), ());
                Err::<bool, _>(ValueError("bad vlan".to_string()))
            },
            true,
        )
        .unwrap();

    let started = Instant::now();
    let result = group.run_and_wait(Duration::from_secs(5)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!result.overall_success);

    let a = result.outcome(0).unwrap();
    assert!(a.matched_expected());
    assert_eq!(a.returned, Some(true));

    let b = result.outcome(1).unwrap();
    assert!(!b.matched_expected());
    assert!(b.failure.is_none());
    assert_eq!(b.returned, Some(false));

    let c = result.outcome(2).unwrap();
    assert!(!c.matched_expected());
    let raised = c.failure.as_ref().and_then(TaskFailure::raised).unwrap();
    let value_error = raised.downcast_ref::<ValueError>().unwrap();
    assert_eq!(value_error.0, "bad vlan");
}

#[test]
fn test_result_is_identical_on_repeated_calls() {
    let mut group: TaskGroup<u16> = TaskGroup::new();
    group.add(|| Ok::<_, anyhow::Error>(1500u16), 1500).unwrap();
    group
        .add(|| Err::<u16, _>(anyhow::anyhow!("link down")), 9000)
        .unwrap();

    assert_eq!(group.result().unwrap_err(), InvalidStateError::NotStarted);
    group.run_and_wait(Duration::from_secs(2)).unwrap();

    let first = serde_json::to_value(group.result().unwrap().summary()).unwrap();
    let second = serde_json::to_value(group.result().unwrap().summary()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["matched"], 1);
    assert_eq!(first["failed"], 1);
}

/// Start tasks, act while they run, then collect the outcome
#[test]
fn test_capture_while_acting() {
    let actions = Arc::new(AtomicUsize::new(0));
    let observed = actions.clone();

    let mut group: TaskGroup<usize> = TaskGroup::with_name("capture");
    group
        .add_named(
            "capture",
            move || {
                std::thread::sleep(Duration::from_millis(200));
                Ok::<_, anyhow::Error>(observed.load(Ordering::SeqCst))
            },
            1,
        )
        .unwrap();

    group.start(Duration::from_secs(5)).unwrap();
    assert_eq!(
        group.add(|| Ok::<_, anyhow::Error>(0), 0).unwrap_err(),
        InvalidStateError::AlreadyStarted
    );

    actions.fetch_add(1, Ordering::SeqCst);

    let result = group.wait().unwrap();
    assert!(result.overall_success);
}

/// A panicking action inside run_while still leaves the group joined
#[test]
fn test_group_joined_when_action_panics() {
    let finished = Arc::new(AtomicUsize::new(0));
    let task_finished = finished.clone();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut group: TaskGroup<bool> = TaskGroup::new();
        group
            .add_check(move || {
                std::thread::sleep(Duration::from_millis(100));
                task_finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(true)
            })
            .unwrap();

        let _ = group.run_while(Duration::from_secs(5), || {
            panic!("migration request rejected")
        });
    }));

    assert!(outcome.is_err());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
