//! The lease record and the lock-store contract the coordinator drives.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LockResult;

/// The externally stored mutual-exclusion token.
///
/// An empty `holder_identity` means the lease is free (released or never held).
/// `version` is opaque and changes on every successful write; it is the
/// expected value for the next compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub name: String,
    pub scope: String,
    pub holder_identity: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub duration: Duration,
    /// Number of times the holder identity has changed
    pub transitions: u32,
    pub version: String,
}

impl LeaseRecord {
    /// Whether any process currently names itself as holder.
    pub fn has_holder(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    /// The holder identity, or `None` when the lease is free.
    pub fn holder(&self) -> Option<&str> {
        self.has_holder().then_some(self.holder_identity.as_str())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.has_holder() && self.holder_identity == identity
    }
}

/// Atomic operations against a single named lease record in an external store.
///
/// Implementations must make `create` and `update` atomic: `create` fails with
/// [`LockError::AlreadyExists`](crate::LockError::AlreadyExists) when a record
/// exists, and `update` fails with [`LockError::Conflict`](crate::LockError::Conflict)
/// when the stored version differs from `expected_version`. Any call may fail
/// with [`LockError::StoreUnavailable`](crate::LockError::StoreUnavailable).
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Lease name within its scope
    fn name(&self) -> &str;

    /// Scope (namespace) the lease lives in
    fn scope(&self) -> &str;

    /// Read the current record, `None` if it does not exist.
    async fn get(&self) -> LockResult<Option<LeaseRecord>>;

    /// Create the record; returns the stored record with its new version.
    async fn create(&self, record: &LeaseRecord) -> LockResult<LeaseRecord>;

    /// Replace the record if the stored version equals `expected_version`.
    async fn update(&self, record: &LeaseRecord, expected_version: &str)
        -> LockResult<LeaseRecord>;

    /// Human readable `scope/name`, used in logs.
    fn describe(&self) -> String {
        format!("{}/{}", self.scope(), self.name())
    }
}
