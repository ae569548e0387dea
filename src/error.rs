//! Error types for lockfleet.

use thiserror::Error;

use crate::coordination::ResourceId;

/// lockfleet error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource is not part of the registry
    #[error("unknown resource: {id}")]
    UnknownResource { id: ResourceId },

    /// A lock could not be taken within the acquisition timeout
    #[error("timed out acquiring {id}")]
    AcquisitionTimeout { id: ResourceId },

    /// No resources were available after all startup attempts
    #[error("no resources configured after {attempts} attempts")]
    ResourceExhaustion { attempts: u32 },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for lockfleet.
pub type Result<T> = std::result::Result<T, Error>;
