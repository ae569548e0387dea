//! lockfleet: periodic workers contending for exclusive resource locks.
//!
//! Each worker profile fires on a fixed-rate timer. A firing locks a random
//! subset of the configured resources with a short timeout, simulates work on
//! each one, and releases everything it took however the run ended.

pub mod config;
pub mod coordination;
pub mod error;
pub mod lifecycle;
pub mod random;
pub mod run;

pub use config::{Config, WorkerProfile};
pub use coordination::{LockCoordinator, ResourceId, ResourceRegistry, WorkerScheduler};
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, Phase, ShutdownReport, ShutdownSignal, StartGate};
pub use run::{RunId, RunStatus};
