//! Error types for leader election

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors returned by a [`LeaseLock`](crate::LeaseLock) operation.
///
/// `AlreadyExists` and `Conflict` are logical outcomes of the store's atomic
/// operations; `StoreUnavailable` is transient and always safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// A create found a record already present
    #[error("Lease record already exists")]
    AlreadyExists,

    /// An update's expected version did not match the stored version
    #[error("Lease record version conflict")]
    Conflict,

    /// The store could not be reached or answered with an unexpected error
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Errors raised while constructing an election.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// Holder identity must be non-empty
    #[error("Holder identity must not be empty")]
    EmptyIdentity,

    /// A configured duration was zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Lease duration must exceed the renew deadline
    #[error("Lease duration ({lease_duration:?}) must be greater than renew deadline ({renew_deadline:?})")]
    LeaseDurationTooShort {
        lease_duration: Duration,
        renew_deadline: Duration,
    },

    /// Renew deadline must leave room for at least one jittered retry
    #[error("Renew deadline ({renew_deadline:?}) must be greater than jittered retry period ({minimum:?})")]
    RenewDeadlineTooShort {
        renew_deadline: Duration,
        minimum: Duration,
    },
}

/// Errors raised while building a lock-store client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to read a credentials file
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Kubeconfig was not valid YAML for the expected shape
    #[error("Failed to parse kubeconfig: {0}")]
    Kubeconfig(#[from] serde_yaml_ng::Error),

    /// Kubeconfig was parsed but lacks a required entry
    #[error("Kubeconfig is missing {0}")]
    MissingEntry(String),

    /// In-cluster environment variables are not set
    #[error("Not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),

    /// Embedded certificate data was not valid base64
    #[error("Invalid base64 certificate data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Result type for lease store operations
pub type LockResult<T> = std::result::Result<T, LockError>;
