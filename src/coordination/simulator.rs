//! Work simulator.
//!
//! Pretends to poll a resource for a random number of one-step iterations.
//! It never touches locks; the resource id is only a label for reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::{Event, EventBus, EventKind};
use super::lock_manager::ResourceId;
use crate::random::RandomSource;
use crate::run::RunId;

/// Roll in `[1, ERROR_ROLL_SIDES]` drawn before each piece of work.
pub const ERROR_ROLL_SIDES: u32 = 8;
/// Roll that fails the work immediately.
pub const FAILURE_ROLL: u32 = 4;
/// Roll that requests cancellation of the run.
pub const CANCEL_ROLL: u32 = 5;

/// Cooperative cancellation flag for one run.
///
/// Setting it never interrupts anything by itself; work checks it between
/// steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag with no cancellation requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why work stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The cancellation flag was set.
    Requested,
    /// A work step failed; handled the same way as a request.
    Fault(String),
}

/// Work that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSuccess {
    pub resource: ResourceId,
    pub iterations: u32,
}

/// Work that did not run to completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// Simulated resource failure before any work was done
    #[error("simulated failure on {resource}")]
    Simulated { resource: ResourceId },

    /// Stopped early after `completed` steps
    #[error("work on {resource} cancelled after {completed} steps")]
    Cancelled {
        resource: ResourceId,
        completed: u32,
        reason: CancelReason,
    },
}

/// One unit of simulated work.
#[async_trait]
pub trait WorkStep: Send + Sync {
    /// Perform step `iteration` (1-based) against `resource`.
    async fn step(&self, resource: &ResourceId, iteration: u32, cancel: &CancelFlag) -> Result<(), String>;
}

/// Default step: wait one interval.
#[derive(Debug, Clone)]
pub struct SleepStep {
    interval: Duration,
}

impl SleepStep {
    /// Create a step that sleeps for `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl WorkStep for SleepStep {
    async fn step(&self, _resource: &ResourceId, _iteration: u32, _cancel: &CancelFlag) -> Result<(), String> {
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

/// Simulates randomized work against a single resource.
pub struct WorkSimulator {
    random: Arc<dyn RandomSource>,
    step: Arc<dyn WorkStep>,
    events: Arc<EventBus>,
}

impl WorkSimulator {
    /// Create a simulator.
    pub fn new(random: Arc<dyn RandomSource>, step: Arc<dyn WorkStep>, events: Arc<EventBus>) -> Self {
        Self { random, step, events }
    }

    /// Simulate `[min_secs, max_secs]` steps of work on `resource`.
    pub async fn simulate(
        &self,
        resource: &ResourceId,
        min_secs: u32,
        max_secs: u32,
        run: &RunId,
        cancel: &CancelFlag,
    ) -> Result<WorkSuccess, WorkError> {
        self.report(EventKind::WorkStarted, run, resource, serde_json::Value::Null)
            .await;

        let roll = self.random.range_inclusive(1, ERROR_ROLL_SIDES);
        if roll == FAILURE_ROLL {
            self.report(EventKind::WorkFailed, run, resource, serde_json::json!({"roll": roll}))
                .await;
            return Err(WorkError::Simulated {
                resource: resource.clone(),
            });
        }
        if roll == CANCEL_ROLL {
            cancel.request();
            self.report(EventKind::CancellationRequested, run, resource, serde_json::Value::Null)
                .await;
        }

        let iterations = self.random.range_inclusive(min_secs, max_secs);

        for iteration in 1..=iterations {
            if cancel.is_requested() {
                return Err(self.cancelled(run, resource, iteration - 1, CancelReason::Requested).await);
            }

            if let Err(fault) = self.step.step(resource, iteration, cancel).await {
                return Err(self.cancelled(run, resource, iteration - 1, CancelReason::Fault(fault)).await);
            }

            self.events.work_progress(run, resource, iteration).await;
        }

        self.report(
            EventKind::WorkSucceeded,
            run,
            resource,
            serde_json::json!({"iterations": iterations}),
        )
        .await;

        Ok(WorkSuccess {
            resource: resource.clone(),
            iterations,
        })
    }

    async fn cancelled(&self, run: &RunId, resource: &ResourceId, completed: u32, reason: CancelReason) -> WorkError {
        let fault = match &reason {
            CancelReason::Fault(msg) => Some(msg.clone()),
            CancelReason::Requested => None,
        };
        self.report(
            EventKind::WorkCancelled,
            run,
            resource,
            serde_json::json!({"completed": completed, "fault": fault}),
        )
        .await;

        WorkError::Cancelled {
            resource: resource.clone(),
            completed,
            reason,
        }
    }

    async fn report(&self, kind: EventKind, run: &RunId, resource: &ResourceId, payload: serde_json::Value) {
        self.events
            .publish(
                Event::new(kind)
                    .for_run(run.clone())
                    .on_resource(resource.clone())
                    .with_payload(payload),
            )
            .await;
    }
}
