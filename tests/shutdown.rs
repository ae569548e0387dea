//! Lifecycle integration tests.
//!
//! Start a whole fleet from configuration, stop it with a timed shutdown
//! future, and check what the drain left behind.

use std::sync::Arc;
use std::time::Duration;

use lockfleet::coordination::{Event, EventKind};
use lockfleet::random::ScriptedRandom;
use lockfleet::{Config, Lifecycle, Phase, WorkerProfile};

fn config(work_secs: u32, period_secs: u64, grace_secs: u64) -> Config {
    let mut config = Config::default();
    config.resources = ["a", "b", "c", "d", "e"].into_iter().map(String::from).collect();
    config.workers = vec![WorkerProfile {
        name: "poller".to_string(),
        resource_count: 2,
        min_work_secs: work_secs,
        max_work_secs: work_secs,
        period_secs,
    }];
    config.shutdown.grace_period_secs = grace_secs;
    config
}

fn position(history: &[Event], kind: &EventKind) -> Option<usize> {
    history.iter().position(|e| &e.kind == kind)
}

/// Scenario 1: Graceful drain
///
/// Firings in flight when shutdown starts finish inside the grace period.
/// No firing starts after shutdown begins and every lock is released.
#[tokio::test(start_paused = true)]
async fn test_graceful_drain() {
    let lifecycle = Lifecycle::new(config(3, 2, 15)).with_random(Arc::new(ScriptedRandom::constant(1)));
    let events = lifecycle.events();
    let signal = lifecycle.signal();

    let report = lifecycle
        .run(tokio::time::sleep(Duration::from_millis(5_500)))
        .await
        .unwrap();

    assert!(report.drained);
    assert_eq!(report.locks_held, 0);
    assert_eq!(signal.phase(), Phase::Terminated);

    let stats = &report.stats["poller"];
    // Ticks at 0, 2 and 4
    assert_eq!(stats.fired, 3);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.abandoned, 0);
    assert_eq!(stats.completed + stats.overran + stats.errored, 3);

    let history = events.recent_events(10_000).await;
    let shutdown_at = position(&history, &EventKind::ShutdownStarted).unwrap();
    assert!(
        history[shutdown_at..]
            .iter()
            .all(|e| e.kind != EventKind::RunStarted)
    );
    assert!(position(&history, &EventKind::ShutdownForced).is_none());
    assert_eq!(history.last().map(|e| &e.kind), Some(&EventKind::ShutdownCompleted));
}

/// Scenario 2: Forced termination
///
/// A firing that outlives the grace period is abandoned. Its locks are
/// still released before the report is built.
#[tokio::test(start_paused = true)]
async fn test_forced_termination_releases_locks() {
    let lifecycle = Lifecycle::new(config(30, 100, 2)).with_random(Arc::new(ScriptedRandom::constant(1)));
    let events = lifecycle.events();

    let started = tokio::time::Instant::now();
    let report = lifecycle.run(tokio::time::sleep(Duration::from_secs(1))).await.unwrap();

    assert!(!report.drained);
    assert_eq!(report.locks_held, 0);
    assert_eq!(report.stats["poller"].abandoned, 1);
    assert_eq!(report.stats["poller"].in_flight, 0);
    assert_eq!(events.count_of(&EventKind::ShutdownForced).await, 1);

    let forced = events.query_events(Some(&[EventKind::ShutdownForced]), None, None, 1).await;
    assert_eq!(forced[0].payload["in_flight"], 1);

    // Shutdown after 1s plus a 2s grace period, nowhere near the 60s of work
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(10));
}

/// Scenario 3: Immediate shutdown
///
/// A shutdown that resolves before the first tick is processed still
/// produces a clean report.
#[tokio::test(start_paused = true)]
async fn test_shutdown_before_first_firing() {
    let lifecycle = Lifecycle::new(config(1, 5, 15)).with_random(Arc::new(ScriptedRandom::constant(1)));
    let events = lifecycle.events();

    let report = lifecycle.run(async {}).await.unwrap();

    assert!(report.drained);
    assert_eq!(report.locks_held, 0);
    assert_eq!(report.stats["poller"].in_flight, 0);
    assert_eq!(events.count_of(&EventKind::ProfileRegistered).await, 1);
    assert_eq!(events.count_of(&EventKind::ShutdownCompleted).await, 1);
}
