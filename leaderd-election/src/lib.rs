//! Lease-based leader election for fleets of equivalent replicas.
//!
//! Replicas compete for a single lease record held by an external,
//! strongly-consistent store. The store's compare-and-swap is the only
//! mutual-exclusion mechanism; this crate orchestrates acquisition, renewal,
//! release and notification around it.
//!
//! # Overview
//!
//! - **[`LeaseLock`]**: atomic get/create/update against the lease record
//! - **[`ElectionCoordinator`]**: the acquire, renew, release state machine
//! - **[`leadership_channel`]**: keep-latest notification of leader changes
//! - **[`KubernetesLeaseLock`]**: a `coordination.k8s.io/v1` Lease backend
//! - **[`InMemoryLeaseLock`]**: a shared in-process store with fault injection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use leaderd_election::{
//!     leadership_channel, ElectionConfig, ElectionCoordinator, HolderIdentity, InMemoryLeaseLock,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lock = InMemoryLeaseLock::new("my-lease", "default");
//! let (events, mut leaders) = leadership_channel();
//!
//! let coordinator = ElectionCoordinator::new(
//!     Arc::new(lock),
//!     HolderIdentity::new("replica-1")?,
//!     ElectionConfig::default(),
//!     events,
//! )?;
//!
//! let cancel = CancellationToken::new();
//! let election = coordinator.spawn(cancel.clone());
//!
//! if let Some(event) = leaders.recv().await {
//!     println!("Leader is now {:?}", event.leader);
//! }
//!
//! // Releases the lease if held
//! cancel.cancel();
//! election.await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod coordinator;
mod error;
pub mod kubernetes;
mod lease;
mod memory;

pub use channel::{leadership_channel, LeadershipEvent, LeadershipReceiver, LeadershipSender};
pub use config::{
    ElectionConfig, HolderIdentity, DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE,
    DEFAULT_RETRY_PERIOD, JITTER_FACTOR,
};
pub use coordinator::{ElectionCoordinator, ElectionState, LeadershipCallbacks, NoopCallbacks};
pub use error::{ClientError, ElectionError, LockError, LockResult, Result};
pub use kubernetes::{ClientConfig, KubernetesLeaseLock};
pub use lease::{LeaseLock, LeaseRecord};
pub use memory::InMemoryLeaseLock;
