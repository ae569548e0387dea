//! Lock coordinator: acquire a random subset, work, always release.
//!
//! Acquisition is unordered and best effort. Resources are tried in a fresh
//! random order with a short timeout each; the first timeout abandons the
//! run. Whatever was acquired is released on every exit path, including the
//! run's future being dropped.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use super::events::EventBus;
use super::lock_manager::{LockResult, ResourceId, ResourceLock};
use super::registry::ResourceRegistry;
use super::simulator::{CancelFlag, WorkError, WorkSimulator, WorkStep, WorkSuccess};
use crate::error::{Error, Result};
use crate::random::RandomSource;
use crate::run::RunId;

/// Outcome of one `acquire_and_run` call.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier.
    pub run: RunId,
    /// How many resources the run asked for.
    pub requested: usize,
    /// Resources acquired, in acquisition order.
    pub acquired: Vec<ResourceId>,
    /// Resource whose lock timed out, if the run was abandoned.
    pub abandoned_on: Option<ResourceId>,
    /// Work outcome per acquired resource (empty when abandoned).
    pub work: Vec<std::result::Result<WorkSuccess, WorkError>>,
    /// Resources released at the end of the run.
    pub released: Vec<ResourceId>,
}

impl RunReport {
    fn new(run: RunId, requested: usize) -> Self {
        Self {
            run,
            requested,
            acquired: Vec::new(),
            abandoned_on: None,
            work: Vec::new(),
            released: Vec::new(),
        }
    }

    /// Check if acquisition was abandoned.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned_on.is_some()
    }

    /// Number of resources whose work completed.
    pub fn succeeded(&self) -> usize {
        self.work.iter().filter(|w| w.is_ok()).count()
    }

    /// Number of resources whose work failed or stopped early.
    pub fn failed(&self) -> usize {
        self.work.iter().filter(|w| w.is_err()).count()
    }
}

/// Locks held by one run.
///
/// Dropping a non-empty set releases everything still in it, so a run that
/// is aborted mid-flight cannot leak a lock.
struct HeldSet {
    run: RunId,
    held: Vec<(ResourceId, Arc<ResourceLock>)>,
}

impl HeldSet {
    fn new(run: RunId) -> Self {
        Self { run, held: Vec::new() }
    }

    fn contains(&self, id: &ResourceId) -> bool {
        self.held.iter().any(|(held, _)| held == id)
    }

    fn push(&mut self, id: ResourceId, lock: Arc<ResourceLock>) {
        self.held.push((id, lock));
    }

    fn ids(&self) -> Vec<ResourceId> {
        self.held.iter().map(|(id, _)| id.clone()).collect()
    }
}

impl Drop for HeldSet {
    fn drop(&mut self) {
        for (id, lock) in self.held.drain(..) {
            if lock.release(&self.run) {
                warn!("[{}] Released {} while abandoning the run", self.run, id);
            }
        }
    }
}

/// Coordinates lock acquisition, work and release for runs.
pub struct LockCoordinator {
    registry: Arc<ResourceRegistry>,
    simulator: WorkSimulator,
    random: Arc<dyn RandomSource>,
    events: Arc<EventBus>,
    lock_timeout: Duration,
}

impl LockCoordinator {
    /// Create a coordinator bound to a registry.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        random: Arc<dyn RandomSource>,
        step: Arc<dyn WorkStep>,
        events: Arc<EventBus>,
        lock_timeout: Duration,
    ) -> Self {
        let simulator = WorkSimulator::new(random.clone(), step, events.clone());
        Self {
            registry,
            simulator,
            random,
            events,
            lock_timeout,
        }
    }

    /// Registry this coordinator locks against.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Acquire `count` random resources, simulate work on each, release all.
    pub async fn acquire_and_run(&self, count: usize, min_secs: u32, max_secs: u32, run: &RunId) -> Result<RunReport> {
        self.acquire_and_run_with_cancel(count, min_secs, max_secs, run, &CancelFlag::new())
            .await
    }

    /// Same as [`acquire_and_run`](Self::acquire_and_run) with a caller-owned cancellation flag.
    pub async fn acquire_and_run_with_cancel(
        &self,
        count: usize,
        min_secs: u32,
        max_secs: u32,
        run: &RunId,
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        let available = self.registry.len();
        if count == 0 || count > available {
            return Err(Error::Config(format!(
                "resource count {} outside 1..={}",
                count, available
            )));
        }

        let mut held = HeldSet::new(run.clone());
        let mut report = RunReport::new(run.clone(), count);

        let acquisition = self.acquire(count, run, &mut held).await;
        report.acquired = held.ids();

        let outcome = match acquisition {
            Ok(()) => {
                for id in &report.acquired {
                    let work = self.simulator.simulate(id, min_secs, max_secs, run, cancel).await;
                    report.work.push(work);
                }
                Ok(())
            }
            Err(Error::AcquisitionTimeout { id }) => {
                report.abandoned_on = Some(id);
                Ok(())
            }
            Err(e) => Err(e),
        };

        report.released = self.release_all(&mut held).await;

        outcome.map(|()| report)
    }

    /// Take locks in a random order until `count` are held or one times out.
    async fn acquire(&self, count: usize, run: &RunId, held: &mut HeldSet) -> Result<()> {
        let resources = self.registry.resources();
        let mut order: Vec<usize> = (0..resources.len()).collect();
        self.random.shuffle(&mut order);

        for id in order.into_iter().take(count).map(|idx| &resources[idx]) {
            if held.contains(id) {
                continue;
            }

            let lock = self.registry.lock_for(id)?;
            match lock.try_lock(run, self.lock_timeout).await {
                LockResult::Acquired => {
                    held.push(id.clone(), lock);
                    self.events.lock_acquired(run, id).await;
                }
                LockResult::Timeout { holder } => {
                    self.events.lock_timeout(run, id, holder.as_ref()).await;
                    return Err(Error::AcquisitionTimeout { id: id.clone() });
                }
                LockResult::AlreadyHeld => {
                    warn!("[{}] {} already held by this run, skipping", run, id);
                }
            }
        }

        Ok(())
    }

    /// Release every lock in the held-set that this run still owns.
    ///
    /// All locks are released before the first event is published, so an
    /// abort while reporting cannot strand a lock outside the held-set.
    async fn release_all(&self, held: &mut HeldSet) -> Vec<ResourceId> {
        let mut released = Vec::with_capacity(held.held.len());
        for (id, lock) in &held.held {
            if lock.release(&held.run) {
                released.push(id.clone());
            } else {
                error!("[{}] Refusing to release {}: not held by this run", held.run, id);
            }
        }
        held.held.clear();

        for id in &released {
            self.events.lock_released(&held.run, id).await;
        }

        released
    }
}
