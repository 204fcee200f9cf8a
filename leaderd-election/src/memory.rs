//! In-process lease store for tests and local experiments.
//!
//! Every [`InMemoryLeaseLock`] handle created from the same store shares one
//! record, so several coordinators can compete for it. Each handle carries its
//! own fault plan, which lets a test make the store unreachable for one
//! contender while the others keep working.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::error::{LockError, LockResult};
use crate::lease::{LeaseLock, LeaseRecord};

#[derive(Debug, Default)]
struct StoreState {
    record: Option<LeaseRecord>,
    next_version: u64,
    writes: u64,
}

#[derive(Debug)]
struct FaultPlan {
    available: bool,
    fail_next: u32,
    random: Option<RandomFaults>,
}

#[derive(Debug)]
struct RandomFaults {
    rng: StdRng,
    unavailable: f64,
    lost_ack: f64,
}

/// Outcome of consulting the fault plan before an operation.
enum Fault {
    None,
    /// Fail without touching the store
    Before,
    /// Apply the operation but report a failure to the caller
    LostAck,
}

impl FaultPlan {
    fn healthy() -> Self {
        Self {
            available: true,
            fail_next: 0,
            random: None,
        }
    }

    fn next(&mut self) -> Fault {
        if !self.available {
            return Fault::Before;
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Fault::Before;
        }
        if let Some(random) = self.random.as_mut() {
            let roll: f64 = random.rng.random();
            if roll < random.unavailable {
                return Fault::Before;
            }
            if roll < random.unavailable + random.lost_ack {
                return Fault::LostAck;
            }
        }
        Fault::None
    }
}

/// A [`LeaseLock`] backed by a shared in-memory record.
#[derive(Debug, Clone)]
pub struct InMemoryLeaseLock {
    name: String,
    scope: String,
    store: Arc<Mutex<StoreState>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl InMemoryLeaseLock {
    pub fn new(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
            store: Arc::new(Mutex::new(StoreState::default())),
            faults: Arc::new(Mutex::new(FaultPlan::healthy())),
        }
    }

    /// A new handle on the same record with an independent, healthy fault plan.
    pub fn handle(&self) -> Self {
        Self {
            name: self.name.clone(),
            scope: self.scope.clone(),
            store: Arc::clone(&self.store),
            faults: Arc::new(Mutex::new(FaultPlan::healthy())),
        }
    }

    /// Make every operation through this handle fail with `StoreUnavailable`.
    pub async fn set_available(&self, available: bool) {
        self.faults.lock().await.available = available;
    }

    /// Fail the next `count` operations through this handle.
    pub async fn fail_next(&self, count: u32) {
        self.faults.lock().await.fail_next = count;
    }

    /// Fail operations at random with a reproducible seed.
    ///
    /// With probability `unavailable` an operation fails before reaching the
    /// store; with probability `lost_ack` it is applied but reported as failed.
    pub async fn with_random_faults(&self, seed: u64, unavailable: f64, lost_ack: f64) {
        self.faults.lock().await.random = Some(RandomFaults {
            rng: StdRng::seed_from_u64(seed),
            unavailable,
            lost_ack,
        });
    }

    /// Current stored record, bypassing fault injection.
    pub async fn snapshot(&self) -> Option<LeaseRecord> {
        self.store.lock().await.record.clone()
    }

    /// Number of successful writes applied to the store.
    pub async fn write_count(&self) -> u64 {
        self.store.lock().await.writes
    }

    fn stamped(&self, state: &mut StoreState, record: &LeaseRecord) -> LeaseRecord {
        state.next_version += 1;
        state.writes += 1;
        LeaseRecord {
            name: self.name.clone(),
            scope: self.scope.clone(),
            version: state.next_version.to_string(),
            ..record.clone()
        }
    }
}

fn lost_ack() -> LockError {
    LockError::StoreUnavailable("response lost after write".to_string())
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> &str {
        &self.scope
    }

    async fn get(&self) -> LockResult<Option<LeaseRecord>> {
        if let Fault::Before = self.faults.lock().await.next() {
            return Err(LockError::StoreUnavailable("injected fault".to_string()));
        }
        Ok(self.store.lock().await.record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> LockResult<LeaseRecord> {
        let fault = self.faults.lock().await.next();
        if let Fault::Before = fault {
            return Err(LockError::StoreUnavailable("injected fault".to_string()));
        }
        let mut state = self.store.lock().await;
        if state.record.is_some() {
            return Err(LockError::AlreadyExists);
        }
        let stored = self.stamped(&mut state, record);
        state.record = Some(stored.clone());
        match fault {
            Fault::LostAck => Err(lost_ack()),
            _ => Ok(stored),
        }
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        expected_version: &str,
    ) -> LockResult<LeaseRecord> {
        let fault = self.faults.lock().await.next();
        if let Fault::Before = fault {
            return Err(LockError::StoreUnavailable("injected fault".to_string()));
        }
        let mut state = self.store.lock().await;
        match state.record.as_ref() {
            Some(current) if current.version == expected_version => {}
            _ => return Err(LockError::Conflict),
        }
        let stored = self.stamped(&mut state, record);
        state.record = Some(stored.clone());
        match fault {
            Fault::LostAck => Err(lost_ack()),
            _ => Ok(stored),
        }
    }
}
