//! Worker scheduler with one fixed-rate timer per profile.
//!
//! Each profile ticks on its own period starting at time zero and spawns a
//! firing per tick. Firings of the same profile are allowed to overlap;
//! contention is left to the resource locks.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::coordinator::LockCoordinator;
use super::events::{Event, EventBus, EventKind};
use crate::config::WorkerProfile;
use crate::lifecycle::{Phase, StartGate};
use crate::run::{RunContext, RunId, RunStatus};

/// Counters for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStats {
    /// Firings admitted by the timer.
    pub fired: u64,
    /// Firings that finished inside their period.
    pub completed: u64,
    /// Firings that took at least one full period.
    pub overran: u64,
    /// Firings where an error escaped the coordinator, or that panicked.
    pub errored: u64,
    /// Firings dropped by forced termination.
    pub abandoned: u64,
    /// Firings currently running.
    pub in_flight: u64,
    /// Outcome of the most recent finished firing.
    pub last_outcome: Option<RunStatus>,
}

impl ProfileStats {
    /// Current state of the profile.
    pub fn status(&self) -> RunStatus {
        if self.in_flight > 0 {
            RunStatus::Firing
        } else {
            RunStatus::Scheduled
        }
    }

    fn record(&mut self, outcome: RunStatus) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            RunStatus::Completed => self.completed += 1,
            RunStatus::Overran => self.overran += 1,
            RunStatus::Errored => self.errored += 1,
            RunStatus::Scheduled | RunStatus::Firing => {}
        }
        self.last_outcome = Some(outcome);
    }
}

/// Snapshot of all profile counters, keyed by profile name.
pub type SchedulerStats = HashMap<String, ProfileStats>;

/// Running profile loops.
pub struct SchedulerHandle {
    loops: JoinSet<()>,
}

impl SchedulerHandle {
    /// Wait until every profile loop has exited.
    pub async fn join(&mut self) {
        while let Some(joined) = self.loops.join_next().await {
            if let Err(e) = joined {
                error!("Profile loop ended abnormally: {}", e);
            }
        }
    }

    /// Number of profile loops still running.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Check if all profile loops have exited.
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

/// Drives every worker profile on its own periodic timer.
pub struct WorkerScheduler {
    profiles: Vec<WorkerProfile>,
    coordinator: Arc<LockCoordinator>,
    events: Arc<EventBus>,
    stats: Mutex<SchedulerStats>,
}

impl WorkerScheduler {
    /// Create a scheduler for the given profiles.
    pub fn new(profiles: Vec<WorkerProfile>, coordinator: Arc<LockCoordinator>, events: Arc<EventBus>) -> Self {
        let stats = profiles
            .iter()
            .map(|p| (p.name.clone(), ProfileStats::default()))
            .collect();
        Self {
            profiles,
            coordinator,
            events,
            stats: Mutex::new(stats),
        }
    }

    /// Profiles driven by this scheduler.
    pub fn profiles(&self) -> &[WorkerProfile] {
        &self.profiles
    }

    /// Register every profile and start its timer loop.
    ///
    /// Firings wait on `gate` before doing anything, and loops stop admitting
    /// firings once `phase` leaves [`Phase::Running`].
    pub async fn start(self: &Arc<Self>, gate: StartGate, phase: watch::Receiver<Phase>) -> SchedulerHandle {
        let mut loops = JoinSet::new();

        for profile in &self.profiles {
            self.events
                .publish(
                    Event::new(EventKind::ProfileRegistered).with_payload(serde_json::json!({
                        "profile": profile.name,
                        "resource_count": profile.resource_count,
                        "min_work_secs": profile.min_work_secs,
                        "max_work_secs": profile.max_work_secs,
                        "period_secs": profile.period_secs,
                    })),
                )
                .await;

            let this = Arc::clone(self);
            loops.spawn(this.profile_loop(profile.clone(), gate.clone(), phase.clone()));
        }

        SchedulerHandle { loops }
    }

    /// Snapshot of the per-profile counters.
    pub async fn stats(&self) -> SchedulerStats {
        self.stats.lock().await.clone()
    }

    async fn profile_loop(self: Arc<Self>, profile: WorkerProfile, gate: StartGate, mut phase: watch::Receiver<Phase>) {
        let mut ticker = tokio::time::interval(profile.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut firings = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = Self::phase_reached(&mut phase, Phase::Draining) => break,
                _ = ticker.tick() => {
                    self.with_stats(&profile.name, |s| {
                        s.fired += 1;
                        s.in_flight += 1;
                    })
                    .await;
                    let this = Arc::clone(&self);
                    firings.spawn(this.fire(profile.clone(), gate.clone()));
                }
                Some(joined) = firings.join_next(), if !firings.is_empty() => {
                    self.reap(&profile, joined).await;
                }
            }
        }

        info!("Profile {} stopped admitting firings ({} in flight)", profile.name, firings.len());

        loop {
            tokio::select! {
                joined = firings.join_next() => match joined {
                    Some(joined) => self.reap(&profile, joined).await,
                    None => break,
                },
                _ = Self::phase_reached(&mut phase, Phase::Terminated) => {
                    firings.abort_all();
                    while let Some(joined) = firings.join_next().await {
                        self.reap(&profile, joined).await;
                    }
                    break;
                }
            }
        }
    }

    /// Resolve once the phase is at least `target`, or the sender is gone.
    ///
    /// Drops the `watch::Ref` before returning so the loop future stays `Send`.
    async fn phase_reached(phase: &mut watch::Receiver<Phase>, target: Phase) {
        let _ = phase.wait_for(|p| *p >= target).await;
    }

    /// One firing: run id, timing, coordinator call, overrun check.
    async fn fire(self: Arc<Self>, profile: WorkerProfile, gate: StartGate) -> RunStatus {
        gate.wait().await;

        let mut ctx = RunContext::start(&profile.name);
        self.events.run_started(&ctx.id, &profile.name).await;

        let started = Instant::now();
        let result = self
            .coordinator
            .acquire_and_run(profile.resource_count, profile.min_work_secs, profile.max_work_secs, &ctx.id)
            .await;
        let elapsed = started.elapsed();
        ctx.finish();

        match result {
            Ok(report) => {
                let status = RunStatus::for_elapsed(elapsed, profile.period());
                let kind = if status == RunStatus::Overran {
                    EventKind::RunOverran
                } else {
                    EventKind::RunCompleted
                };
                self.events
                    .publish(Event::new(kind).for_run(ctx.id.clone()).with_payload(serde_json::json!({
                        "profile": profile.name,
                        "elapsed_secs": elapsed.as_secs(),
                        "period_secs": profile.period_secs,
                        "acquired": report.acquired.len(),
                        "abandoned_on": report.abandoned_on.as_ref().map(|r| r.0.clone()),
                        "succeeded": report.succeeded(),
                        "failed": report.failed(),
                    })))
                    .await;
                status
            }
            Err(e) => {
                self.report_error(&ctx.id, &profile, &e.to_string()).await;
                RunStatus::Errored
            }
        }
    }

    async fn reap(&self, profile: &WorkerProfile, joined: Result<RunStatus, JoinError>) {
        match joined {
            Ok(status) => self.with_stats(&profile.name, |s| s.record(status)).await,
            Err(e) if e.is_cancelled() => {
                self.with_stats(&profile.name, |s| {
                    s.in_flight = s.in_flight.saturating_sub(1);
                    s.abandoned += 1;
                })
                .await;
            }
            Err(e) => {
                // Panics lose the run id; report against the profile.
                error!("Firing of profile {} panicked: {}", profile.name, e);
                self.with_stats(&profile.name, |s| s.record(RunStatus::Errored)).await;
            }
        }
    }

    async fn report_error(&self, run: &RunId, profile: &WorkerProfile, error: &str) {
        self.events.run_errored(run, &profile.name, error).await;
    }

    async fn with_stats(&self, name: &str, update: impl FnOnce(&mut ProfileStats)) {
        let mut stats = self.stats.lock().await;
        update(stats.entry(name.to_string()).or_default());
    }
}
