//! Exclusive, non-reentrant resource locks.
//!
//! Each lock records the run that holds it. Only that run can release it,
//! and a run asking again for a lock it already holds is refused instead of
//! being granted a second time.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::run::RunId;

/// Unique identifier for a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    /// Create a named resource ID.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

/// Lock acquisition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// Lock acquired successfully.
    Acquired,
    /// Timeout elapsed while another run held the lock.
    Timeout { holder: Option<RunId> },
    /// The requesting run already holds this lock.
    AlreadyHeld,
}

/// Current holder of a lock.
#[derive(Debug, Clone)]
struct Holder {
    run: RunId,
    acquired_at: Instant,
}

/// One exclusive lock guarding one resource.
pub struct ResourceLock {
    /// Resource this lock guards.
    id: ResourceId,
    /// Single permit; whoever owns it holds the lock.
    permit: Semaphore,
    /// Run that owns the permit.
    holder: Mutex<Option<Holder>>,
}

impl ResourceLock {
    /// Create an unheld lock for a resource.
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            permit: Semaphore::new(1),
            holder: Mutex::new(None),
        }
    }

    /// Resource guarded by this lock.
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Try to acquire the lock for `run`, waiting at most `timeout`.
    pub async fn try_lock(&self, run: &RunId, timeout: Duration) -> LockResult {
        if self.holder().as_ref() == Some(run) {
            return LockResult::AlreadyHeld;
        }

        match tokio::time::timeout(timeout, self.permit.acquire()).await {
            Ok(Ok(permit)) => {
                // Ownership moves to the holder record; release() adds the permit back.
                permit.forget();
                *self.lock_holder() = Some(Holder {
                    run: run.clone(),
                    acquired_at: Instant::now(),
                });
                LockResult::Acquired
            }
            // The semaphore is never closed, so both arms mean "not acquired".
            Ok(Err(_)) | Err(_) => LockResult::Timeout { holder: self.holder() },
        }
    }

    /// Release the lock if `run` holds it.
    ///
    /// Returns `false` without touching the lock when `run` is not the holder,
    /// so a stray or repeated release never unlocks someone else's hold.
    pub fn release(&self, run: &RunId) -> bool {
        let mut holder = self.lock_holder();
        match holder.as_ref() {
            Some(h) if &h.run == run => {
                *holder = None;
                self.permit.add_permits(1);
                true
            }
            _ => false,
        }
    }

    /// Check if the lock is held.
    pub fn is_locked(&self) -> bool {
        self.lock_holder().is_some()
    }

    /// Check if `run` holds the lock.
    pub fn is_held_by(&self, run: &RunId) -> bool {
        self.lock_holder().as_ref().is_some_and(|h| &h.run == run)
    }

    /// Get the holder of the lock (if any).
    pub fn holder(&self) -> Option<RunId> {
        self.lock_holder().as_ref().map(|h| h.run.clone())
    }

    /// How long the current holder has had the lock.
    pub fn held_for(&self) -> Option<Duration> {
        self.lock_holder().as_ref().map(|h| h.acquired_at.elapsed())
    }

    fn lock_holder(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("id", &self.id)
            .field("holder", &self.holder())
            .finish()
    }
}
