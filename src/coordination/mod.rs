//! Resource coordination.
//!
//! Shared infrastructure for runs contending over a fixed set of resources:
//! - Registry: one exclusive lock per resource
//! - Lock coordinator: random subset acquisition with rollback and guaranteed release
//! - Work simulator: randomized, cancellable work per resource
//! - Scheduler: fixed-rate firing per worker profile
//! - Event bus: reporting for every acquire, release and outcome

pub mod coordinator;
pub mod events;
pub mod lock_manager;
pub mod registry;
pub mod scheduler;
pub mod simulator;

pub use coordinator::{LockCoordinator, RunReport};
pub use events::{Event, EventBus, EventKind};
pub use lock_manager::{LockResult, ResourceId, ResourceLock};
pub use registry::ResourceRegistry;
pub use scheduler::{ProfileStats, SchedulerHandle, SchedulerStats, WorkerScheduler};
pub use simulator::{CancelFlag, CancelReason, SleepStep, WorkError, WorkSimulator, WorkStep, WorkSuccess};
