//! Fleet lifecycle: startup ordering, start gate and bounded shutdown drain.
//!
//! Construction order is fixed: registry, coordinator, scheduler, then the
//! gate opens. Shutdown moves the process through
//! `Running -> Draining -> Terminated`; firings already started get the grace
//! period, anything still running after it is abandoned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::Config;
use crate::coordination::{
    Event, EventBus, EventKind, LockCoordinator, ResourceRegistry, SchedulerStats, SleepStep, WorkStep,
    WorkerScheduler,
};
use crate::error::{Error, Result};
use crate::random::{RandomSource, ThreadRandom};

/// Process-wide shutdown phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Firings are admitted.
    Running,
    /// No new firings; in-flight firings may finish.
    Draining,
    /// Grace period over; everything still running is abandoned.
    Terminated,
}

/// Shared handle to the shutdown phase.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Phase>>,
}

impl ShutdownSignal {
    /// Create a signal in [`Phase::Running`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Move to `to` if it is later than the current phase.
    ///
    /// Returns `false` (and changes nothing) for a backwards or repeated move.
    pub fn advance(&self, to: Phase) -> bool {
        self.tx.send_if_modified(|phase| {
            if to > *phase {
                *phase = to;
                true
            } else {
                false
            }
        })
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.tx.borrow()
    }

    /// Receiver that observes phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot gate released once every profile is registered.
#[derive(Debug, Clone)]
pub struct StartGate {
    tx: Arc<watch::Sender<bool>>,
}

impl StartGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| !std::mem::replace(open, true))
    }

    /// Check if the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open. Returns immediately once opened.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the resource list comes from at startup.
pub trait ResourceSource: Send + Sync {
    /// Current list of resource identifiers (may be empty).
    fn load(&self) -> Vec<String>;
}

impl ResourceSource for Vec<String> {
    fn load(&self) -> Vec<String> {
        self.clone()
    }
}

/// Summary returned once the fleet has stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Whether every in-flight firing finished inside the grace period.
    pub drained: bool,
    /// Per-profile counters at the end.
    pub stats: SchedulerStats,
    /// Locks still held after termination.
    pub locks_held: usize,
}

/// Builds and runs the fleet.
pub struct Lifecycle {
    config: Config,
    source: Box<dyn ResourceSource>,
    random: Arc<dyn RandomSource>,
    step: Arc<dyn WorkStep>,
    events: Arc<EventBus>,
    signal: ShutdownSignal,
}

impl Lifecycle {
    /// Create a lifecycle from configuration, using its resources as the source.
    pub fn new(config: Config) -> Self {
        let random: Arc<dyn RandomSource> = match config.seed {
            Some(seed) => Arc::new(ThreadRandom::seeded(seed)),
            None => Arc::new(ThreadRandom::new()),
        };
        let step = Arc::new(SleepStep::new(config.coordination.step_interval()));
        Self {
            source: Box::new(config.resources.clone()),
            random,
            step,
            events: Arc::new(EventBus::new()),
            signal: ShutdownSignal::new(),
            config,
        }
    }

    /// Replace the resource source.
    pub fn with_source(mut self, source: impl ResourceSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Replace the random source.
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Replace the work step.
    pub fn with_step(mut self, step: Arc<dyn WorkStep>) -> Self {
        self.step = step;
        self
    }

    /// Event bus all components report to.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Shutdown signal for this fleet.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Start the fleet and run until `shutdown` resolves, then drain.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<ShutdownReport> {
        let registry = Arc::new(self.wait_for_resources().await?);
        for profile in &self.config.workers {
            profile.check_fits(registry.len())?;
        }

        let coordinator = Arc::new(LockCoordinator::new(
            registry.clone(),
            self.random.clone(),
            self.step.clone(),
            self.events.clone(),
            self.config.coordination.lock_timeout(),
        ));
        let scheduler = Arc::new(WorkerScheduler::new(
            self.config.workers.clone(),
            coordinator,
            self.events.clone(),
        ));

        let gate = StartGate::new();
        info!("Registering {} worker profiles", scheduler.profiles().len());
        let mut handle = scheduler.start(gate.clone(), self.signal.subscribe()).await;
        gate.open();
        info!(
            "Registered {} worker profiles against {} resources",
            scheduler.profiles().len(),
            registry.len()
        );

        shutdown.await;

        let grace = self.config.shutdown.grace_period();
        self.signal.advance(Phase::Draining);
        self.events
            .publish(
                Event::new(EventKind::ShutdownStarted)
                    .with_payload(serde_json::json!({"grace_period_secs": grace.as_secs()})),
            )
            .await;

        let drained = tokio::time::timeout(grace, handle.join()).await.is_ok();
        if !drained {
            self.events
                .publish(Event::new(EventKind::ShutdownForced).with_payload(serde_json::json!({
                    "in_flight": Self::in_flight(&scheduler.stats().await),
                })))
                .await;
        }

        self.signal.advance(Phase::Terminated);
        handle.join().await;

        let report = ShutdownReport {
            drained,
            stats: scheduler.stats().await,
            locks_held: registry.held_count(),
        };
        self.events
            .publish(Event::new(EventKind::ShutdownCompleted).with_payload(serde_json::json!({
                "drained": report.drained,
                "locks_held": report.locks_held,
            })))
            .await;

        Ok(report)
    }

    /// Load the resource list, retrying while it is empty.
    async fn wait_for_resources(&self) -> Result<ResourceRegistry> {
        let attempts = self.config.startup.max_attempts.max(1);
        let delay = self.config.startup.retry_delay();

        for attempt in 1..=attempts {
            let names = self.source.load();
            if !names.is_empty() {
                return Ok(ResourceRegistry::new(names));
            }

            self.events
                .publish(Event::new(EventKind::NoResources).with_payload(serde_json::json!({
                    "attempt": attempt,
                    "max_attempts": attempts,
                    "retry_in_secs": delay.as_secs(),
                })))
                .await;

            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::ResourceExhaustion { attempts })
    }

    fn in_flight(stats: &SchedulerStats) -> u64 {
        stats.values().map(|s| s.in_flight).sum()
    }
}

/// Resolve when the process receives Ctrl-C.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        // Without a signal there is no way to stop; wait forever.
        std::future::pending::<()>().await;
    }
}

/// Total time startup spends retrying an empty resource list before giving up.
pub fn startup_window(config: &Config) -> Duration {
    config.startup.retry_delay() * config.startup.max_attempts.saturating_sub(1)
}
