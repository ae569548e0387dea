//! Event bus for run reporting.
//!
//! Every acquire, timeout, release, work outcome, overrun and shutdown phase
//! is published here. Events are kept in a bounded history with per-kind
//! counts and mirrored to the log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::lock_manager::ResourceId;
use crate::run::RunId;

/// Kinds of events that can be published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A worker profile was registered with the scheduler.
    ProfileRegistered,
    /// A firing started.
    RunStarted,
    /// A firing finished inside its period.
    RunCompleted,
    /// A firing took at least one full period.
    RunOverran,
    /// An error escaped the coordinator.
    RunErrored,
    /// A resource lock was acquired.
    LockAcquired,
    /// A resource lock could not be acquired in time.
    LockTimeout,
    /// A resource lock was released.
    LockReleased,
    /// Work on a resource started.
    WorkStarted,
    /// One work step finished.
    WorkProgress,
    /// Work on a resource finished.
    WorkSucceeded,
    /// Work on a resource failed.
    WorkFailed,
    /// Work on a resource stopped early.
    WorkCancelled,
    /// A run asked for its own cancellation.
    CancellationRequested,
    /// The resource source returned nothing at startup.
    NoResources,
    /// Draining began; no new firings are admitted.
    ShutdownStarted,
    /// The grace period ran out and remaining firings were abandoned.
    ShutdownForced,
    /// The scheduler stopped.
    ShutdownCompleted,
    /// Custom event type.
    Custom(String),
}

impl EventKind {
    /// Log level used when mirroring this kind to the log.
    pub fn level(&self) -> log::Level {
        match self {
            EventKind::WorkProgress => log::Level::Debug,
            EventKind::LockTimeout
            | EventKind::WorkFailed
            | EventKind::RunOverran
            | EventKind::NoResources
            | EventKind::ShutdownForced => log::Level::Warn,
            EventKind::RunErrored => log::Level::Error,
            _ => log::Level::Info,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::ProfileRegistered => "profile_registered",
            EventKind::RunStarted => "run_started",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunOverran => "run_overran",
            EventKind::RunErrored => "run_errored",
            EventKind::LockAcquired => "lock_acquired",
            EventKind::LockTimeout => "lock_timeout",
            EventKind::LockReleased => "lock_released",
            EventKind::WorkStarted => "work_started",
            EventKind::WorkProgress => "work_progress",
            EventKind::WorkSucceeded => "work_succeeded",
            EventKind::WorkFailed => "work_failed",
            EventKind::WorkCancelled => "work_cancelled",
            EventKind::CancellationRequested => "cancellation_requested",
            EventKind::NoResources => "no_resources",
            EventKind::ShutdownStarted => "shutdown_started",
            EventKind::ShutdownForced => "shutdown_forced",
            EventKind::ShutdownCompleted => "shutdown_completed",
            EventKind::Custom(s) => return write!(f, "custom:{}", s),
        };
        f.write_str(name)
    }
}

/// An event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Kind of event.
    pub kind: EventKind,
    /// Run the event belongs to (if applicable).
    pub run: Option<RunId>,
    /// Resource the event concerns (if applicable).
    pub resource: Option<ResourceId>,
    /// Event payload (JSON).
    pub payload: serde_json::Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            run: None,
            resource: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Set the run.
    pub fn for_run(mut self, run: RunId) -> Self {
        self.run = Some(run);
        self
    }

    /// Set the resource.
    pub fn on_resource(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let run = self.run.as_ref().map(|r| r.0.as_str()).unwrap_or("-");
        write!(f, "[{}] [{}] {}", run, self.timestamp.to_rfc3339(), self.kind)?;
        if let Some(resource) = &self.resource {
            write!(f, " resource={}", resource)?;
        }
        if !self.payload.is_null() {
            write!(f, " {}", self.payload)?;
        }
        Ok(())
    }
}

/// Event bus shared by the coordinator, simulator, scheduler and lifecycle.
pub struct EventBus {
    /// History of recent events.
    history: Arc<Mutex<Vec<Event>>>,
    /// Maximum history size.
    max_history: usize,
    /// Event counts by kind.
    counts: Arc<Mutex<HashMap<EventKind, usize>>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self::with_history_size(1000)
    }

    /// Create an event bus with custom history size.
    pub fn with_history_size(size: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
            max_history: size,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish an event.
    pub async fn publish(&self, event: Event) {
        log::log!(event.kind.level(), "{}", event);

        {
            let mut history = self.history.lock().await;
            history.push(event.clone());
            while history.len() > self.max_history {
                history.remove(0);
            }
        }

        let mut counts = self.counts.lock().await;
        *counts.entry(event.kind).or_insert(0) += 1;
    }

    /// Get recent events, oldest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    /// Get events matching a filter, newest first.
    pub async fn query_events(
        &self,
        kinds: Option<&[EventKind]>,
        run: Option<&RunId>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<Event> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .filter(|e| {
                if let Some(k) = kinds
                    && !k.contains(&e.kind)
                {
                    return false;
                }
                if let Some(run) = run
                    && e.run.as_ref() != Some(run)
                {
                    return false;
                }
                if let Some(since) = since
                    && e.timestamp < since
                {
                    return false;
                }
                true
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Get event counts by kind.
    pub async fn event_counts(&self) -> HashMap<EventKind, usize> {
        self.counts.lock().await.clone()
    }

    /// Count of a single kind.
    pub async fn count_of(&self, kind: &EventKind) -> usize {
        self.counts.lock().await.get(kind).copied().unwrap_or(0)
    }

    /// Hold the history lock, stalling every publisher until the guard drops.
    #[cfg(test)]
    pub(crate) async fn lock_history(&self) -> tokio::sync::OwnedMutexGuard<Vec<Event>> {
        self.history.clone().lock_owned().await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// Convenience functions for common events
impl EventBus {
    /// Publish a lock acquired event.
    pub async fn lock_acquired(&self, run: &RunId, resource: &ResourceId) {
        self.publish(Event::new(EventKind::LockAcquired).for_run(run.clone()).on_resource(resource.clone()))
            .await;
    }

    /// Publish a lock timeout event.
    pub async fn lock_timeout(&self, run: &RunId, resource: &ResourceId, holder: Option<&RunId>) {
        self.publish(
            Event::new(EventKind::LockTimeout)
                .for_run(run.clone())
                .on_resource(resource.clone())
                .with_payload(serde_json::json!({"holder": holder.map(|h| h.0.clone())})),
        )
        .await;
    }

    /// Publish a lock released event.
    pub async fn lock_released(&self, run: &RunId, resource: &ResourceId) {
        self.publish(Event::new(EventKind::LockReleased).for_run(run.clone()).on_resource(resource.clone()))
            .await;
    }

    /// Publish a work progress event.
    pub async fn work_progress(&self, run: &RunId, resource: &ResourceId, iteration: u32) {
        self.publish(
            Event::new(EventKind::WorkProgress)
                .for_run(run.clone())
                .on_resource(resource.clone())
                .with_payload(serde_json::json!({"iteration": iteration})),
        )
        .await;
    }

    /// Publish a run started event.
    pub async fn run_started(&self, run: &RunId, profile: &str) {
        self.publish(
            Event::new(EventKind::RunStarted)
                .for_run(run.clone())
                .with_payload(serde_json::json!({"profile": profile})),
        )
        .await;
    }

    /// Publish a run errored event.
    pub async fn run_errored(&self, run: &RunId, profile: &str, error: &str) {
        self.publish(
            Event::new(EventKind::RunErrored)
                .for_run(run.clone())
                .with_payload(serde_json::json!({"profile": profile, "error": error})),
        )
        .await;
    }
}
