//! Contention integration tests.
//!
//! Drive the coordinator and scheduler through the public API with scripted
//! or seeded randomness and check that locks are exclusive, always released,
//! and that failures stay local to the resource they hit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lockfleet::coordination::simulator::FAILURE_ROLL;
use lockfleet::coordination::{
    CancelFlag, CancelReason, EventBus, EventKind, LockCoordinator, LockResult, ResourceId, ResourceRegistry,
    WorkError, WorkStep, WorkerScheduler,
};
use lockfleet::lifecycle::{Phase, StartGate};
use lockfleet::random::{RandomSource, ScriptedRandom, ThreadRandom};
use lockfleet::{RunId, WorkerProfile};
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_millis(100);

/// Step that records which resources are being worked on right now.
///
/// Work only happens under a lock, so two concurrent steps on the same
/// resource mean two runs held it at once.
#[derive(Default)]
struct ExclusiveStep {
    active: Mutex<HashSet<ResourceId>>,
    violations: AtomicU32,
    steps: AtomicU32,
}

#[async_trait]
impl WorkStep for ExclusiveStep {
    async fn step(&self, resource: &ResourceId, _iteration: u32, _cancel: &CancelFlag) -> Result<(), String> {
        if !self.active.lock().unwrap().insert(resource.clone()) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.active.lock().unwrap().remove(resource);
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Step that requests cancellation of the run after a given iteration.
struct CancelAfter(u32);

#[async_trait]
impl WorkStep for CancelAfter {
    async fn step(&self, _resource: &ResourceId, iteration: u32, cancel: &CancelFlag) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if iteration == self.0 {
            cancel.request();
        }
        Ok(())
    }
}

fn coordinator(
    names: &[&str],
    random: Arc<dyn RandomSource>,
    step: Arc<dyn WorkStep>,
) -> (Arc<LockCoordinator>, Arc<ResourceRegistry>, Arc<EventBus>) {
    let registry = Arc::new(ResourceRegistry::new(names.iter().copied()));
    let events = Arc::new(EventBus::with_history_size(50_000));
    let coordinator = Arc::new(LockCoordinator::new(registry.clone(), random, step, events.clone(), TIMEOUT));
    (coordinator, registry, events)
}

fn profile(name: &str, count: usize, secs: u32, period: u64) -> WorkerProfile {
    WorkerProfile {
        name: name.to_string(),
        resource_count: count,
        min_work_secs: secs,
        max_work_secs: secs,
        period_secs: period,
    }
}

/// Scenario 1: Heavy contention across two profiles
///
/// More locks are demanded than exist. Over a hundred firings no resource is
/// ever worked on by two runs at once, and nothing is left locked.
#[tokio::test(start_paused = true)]
async fn test_no_resource_is_ever_double_held() {
    let step = Arc::new(ExclusiveStep::default());
    let (coordinator, registry, events) = coordinator(
        &["n1", "n2", "n3", "n4", "n5"],
        Arc::new(ThreadRandom::seeded(2024)),
        step.clone(),
    );
    let scheduler = Arc::new(WorkerScheduler::new(
        vec![profile("slow", 2, 3, 2), profile("fast", 3, 2, 1)],
        coordinator,
        events.clone(),
    ));
    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    let gate = StartGate::new();

    let mut handle = scheduler.start(gate.clone(), phase_rx).await;
    gate.open();
    tokio::time::sleep(Duration::from_millis(69_500)).await;
    phase_tx.send_replace(Phase::Draining);
    handle.join().await;

    let stats = scheduler.stats().await;
    let fired: u64 = stats.values().map(|s| s.fired).sum();
    assert!(fired >= 100, "only {} firings", fired);
    assert!(stats.values().all(|s| s.in_flight == 0));

    assert_eq!(step.violations.load(Ordering::SeqCst), 0);
    assert!(step.steps.load(Ordering::SeqCst) > 0);
    assert!(events.count_of(&EventKind::LockTimeout).await > 0);
    assert_eq!(
        events.count_of(&EventKind::LockAcquired).await,
        events.count_of(&EventKind::LockReleased).await
    );
    assert_eq!(registry.held_count(), 0);
}

/// Scenario 2: Identical profiles firing in lockstep
///
/// Four profiles lock 2 of 5 resources with one-second work every 10s,
/// all ticking at the same instants, for a hundred firings in total.
#[tokio::test(start_paused = true)]
async fn test_lockstep_profiles_stay_exclusive() {
    let step = Arc::new(ExclusiveStep::default());
    let (coordinator, registry, events) = coordinator(
        &["n1", "n2", "n3", "n4", "n5"],
        Arc::new(ThreadRandom::seeded(7)),
        step.clone(),
    );
    let profiles = (1..=4).map(|i| profile(&format!("p{}", i), 2, 1, 10)).collect();
    let scheduler = Arc::new(WorkerScheduler::new(profiles, coordinator, events.clone()));
    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    let gate = StartGate::new();

    let mut handle = scheduler.start(gate.clone(), phase_rx).await;
    gate.open();
    // Ticks at 0, 10, ..., 240
    tokio::time::sleep(Duration::from_secs(245)).await;
    phase_tx.send_replace(Phase::Draining);
    handle.join().await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.values().map(|s| s.fired).sum::<u64>(), 100);
    assert_eq!(stats.values().map(|s| s.errored).sum::<u64>(), 0);
    assert_eq!(step.violations.load(Ordering::SeqCst), 0);
    assert_eq!(
        events.count_of(&EventKind::LockAcquired).await,
        events.count_of(&EventKind::LockReleased).await
    );
    assert_eq!(registry.held_count(), 0);
}

/// Scenario 3: Simulated failure
///
/// An error roll of 4 fails the work without a single step, and the lock
/// is released after the failure is reported.
#[tokio::test]
async fn test_simulated_failure_releases_lock() {
    let step = Arc::new(ExclusiveStep::default());
    let (coordinator, registry, events) = coordinator(
        &["a", "b"],
        Arc::new(ScriptedRandom::new([FAILURE_ROLL], 1)),
        step.clone(),
    );
    let run = RunId::new();

    let report = coordinator.acquire_and_run(1, 1, 1, &run).await.unwrap();

    assert_eq!(report.acquired, vec![ResourceId::named("a")]);
    assert!(matches!(&report.work[0], Err(WorkError::Simulated { resource }) if resource.0 == "a"));
    assert_eq!(report.released, vec![ResourceId::named("a")]);
    assert_eq!(step.steps.load(Ordering::SeqCst), 0);
    assert_eq!(registry.held_count(), 0);

    let mut kinds: Vec<_> = events
        .query_events(None, Some(&run), None, 100)
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    kinds.reverse();
    assert_eq!(
        kinds,
        vec![
            EventKind::LockAcquired,
            EventKind::WorkStarted,
            EventKind::WorkFailed,
            EventKind::LockReleased,
        ]
    );
}

/// Scenario 4: Cancellation mid-work
///
/// Cancelling after the second of five steps stops the current resource
/// with two steps done. The flag belongs to the run, so the next resource
/// stops before its first step. Both locks are released.
#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_work_releases_everything() {
    let (coordinator, registry, _events) = coordinator(
        &["a", "b"],
        Arc::new(ScriptedRandom::constant(1)),
        Arc::new(CancelAfter(2)),
    );

    let report = coordinator.acquire_and_run(2, 5, 5, &RunId::new()).await.unwrap();

    assert_eq!(report.work.len(), 2);
    assert!(matches!(
        report.work[0],
        Err(WorkError::Cancelled {
            completed: 2,
            reason: CancelReason::Requested,
            ..
        })
    ));
    assert!(matches!(report.work[1], Err(WorkError::Cancelled { completed: 0, .. })));
    assert_eq!(report.released.len(), 2);
    assert_eq!(registry.held_count(), 0);
}

/// Scenario 5: Abandonment on a held resource
///
/// A run that finds a resource held elsewhere gives up after the timeout,
/// releases what it already took, and leaves the other holder alone. Once
/// the holder lets go, the same request succeeds.
#[tokio::test(start_paused = true)]
async fn test_abandon_then_retry_after_holder_releases() {
    let (coordinator, registry, events) = coordinator(
        &["a", "b", "c"],
        Arc::new(ScriptedRandom::constant(1)),
        Arc::new(ExclusiveStep::default()),
    );
    let holder = RunId::new();
    let c = registry.lock_for(&ResourceId::named("c")).unwrap();
    assert_eq!(c.try_lock(&holder, TIMEOUT).await, LockResult::Acquired);

    let started = tokio::time::Instant::now();
    let report = coordinator.acquire_and_run(3, 1, 1, &RunId::new()).await.unwrap();

    assert!(report.is_abandoned());
    assert_eq!(report.abandoned_on, Some(ResourceId::named("c")));
    assert_eq!(report.released, vec![ResourceId::named("a"), ResourceId::named("b")]);
    assert!(report.work.is_empty());
    assert!(started.elapsed() >= TIMEOUT);
    assert!(c.is_held_by(&holder));
    assert_eq!(registry.held_count(), 1);

    let timeout = events.query_events(Some(&[EventKind::LockTimeout]), None, None, 1).await;
    assert_eq!(timeout[0].payload["holder"], holder.0.as_str());

    assert!(c.release(&holder));
    let report = coordinator.acquire_and_run(3, 1, 1, &RunId::new()).await.unwrap();
    assert!(!report.is_abandoned());
    assert_eq!(report.succeeded(), 3);
    assert_eq!(registry.held_count(), 0);
}

/// Scenario 6: Aborted runs under load
///
/// Runs aborted while holding locks give them back, so later runs are not
/// starved.
#[tokio::test(start_paused = true)]
async fn test_aborted_runs_do_not_starve_later_runs() {
    let (coordinator, registry, _events) = coordinator(
        &["a", "b"],
        Arc::new(ScriptedRandom::constant(1)),
        Arc::new(ExclusiveStep::default()),
    );

    let stuck = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.acquire_and_run(2, 600, 600, &RunId::new()).await })
    };
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(registry.held_count(), 2);

    let blocked = coordinator.acquire_and_run(1, 1, 1, &RunId::new()).await.unwrap();
    assert!(blocked.is_abandoned());

    stuck.abort();
    assert!(stuck.await.unwrap_err().is_cancelled());
    assert_eq!(registry.held_count(), 0);

    let report = coordinator.acquire_and_run(2, 1, 1, &RunId::new()).await.unwrap();
    assert_eq!(report.succeeded(), 2);
}
