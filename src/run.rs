//! Run types for lockfleet.
//!
//! A run is one scheduled firing of a worker profile: acquisition, work and
//! release under a single identifier.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new run ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("run-{}", Uuid::now_v7()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-profile firing state: `Scheduled -> Firing -> (Completed | Overran | Errored)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Waiting for the next tick
    Scheduled,
    /// Acquiring, working or releasing
    Firing,
    /// Finished inside its period
    Completed,
    /// Finished, but took at least one full period
    Overran,
    /// An error escaped the coordinator
    Errored,
}

impl RunStatus {
    /// Check if the firing has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Overran | RunStatus::Errored)
    }

    /// Classify a finished firing by comparing whole elapsed seconds to the period.
    pub fn for_elapsed(elapsed: Duration, period: Duration) -> Self {
        if elapsed.as_secs() >= period.as_secs() {
            RunStatus::Overran
        } else {
            RunStatus::Completed
        }
    }
}

/// Ephemeral timing record for one firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Run identifier
    pub id: RunId,
    /// Name of the profile that fired
    pub profile: String,
    /// When the firing started
    pub started_at: DateTime<Utc>,
    /// When the firing ended
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunContext {
    /// Start a new firing for the named profile.
    pub fn start(profile: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            profile: profile.into(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Mark the firing as finished.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
