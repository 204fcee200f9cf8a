//! The election loop: acquire, renew and release a lease through a [`LeaseLock`].
//!
//! A coordinator moves through these states:
//!
//! ```text
//! Idle -> Acquiring <-> Observing
//!            |
//!            v
//!         Leading --(renew deadline missed / taken over)--> Acquiring
//!            |
//!        (cancelled)
//!            v
//!        Releasing -> Idle
//! ```
//!
//! Another holder's lease is judged expired by the local monotonic clock: the
//! coordinator remembers when it first saw the current record version and
//! treats the lease as valid until `duration` has passed since then. Remote
//! timestamps are never compared with the local wall clock, so clock skew
//! between replicas cannot shorten a lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::channel::{LeadershipEvent, LeadershipSender};
use crate::config::{ElectionConfig, HolderIdentity, JITTER_FACTOR};
use crate::error::{LockError, Result};
use crate::lease::{LeaseLock, LeaseRecord};

/// Lease duration written when releasing, so observers see a free lease.
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Where a coordinator is in its election cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Acquiring,
    /// Another holder's lease is valid; polling until it changes or expires
    Observing,
    Leading,
    Releasing,
}

/// Hooks fired when this process gains or loses leadership.
pub trait LeadershipCallbacks: Send + Sync {
    fn on_started_leading(&self) {}

    fn on_stopped_leading(&self) {}
}

/// Callbacks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl LeadershipCallbacks for NoopCallbacks {}

/// Result of a single read-then-write round against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// This process holds the lease after the round
    Held,
    /// Another holder's lease is still valid
    HeldByOther,
    /// Transient failure or lost race; try again later
    Failed,
}

/// Why the renewal loop ended.
enum RenewOutcome {
    Lost,
    Cancelled,
}

#[derive(Debug)]
struct Observation {
    record: LeaseRecord,
    at: Instant,
}

/// Drives a [`LeaseLock`] through the acquire, renew and release cycle.
pub struct ElectionCoordinator {
    lock: Arc<dyn LeaseLock>,
    identity: HolderIdentity,
    config: ElectionConfig,
    events: LeadershipSender,
    callbacks: Arc<dyn LeadershipCallbacks>,
    state: watch::Sender<ElectionState>,
    observed: Option<Observation>,
    reported: Option<String>,
    last_renewed: Option<Instant>,
}

impl ElectionCoordinator {
    /// Create a coordinator, validating the configuration.
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: HolderIdentity,
        config: ElectionConfig,
        events: LeadershipSender,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ElectionState::Idle);
        Ok(Self {
            lock,
            identity,
            config,
            events,
            callbacks: Arc::new(NoopCallbacks),
            state,
            observed: None,
            reported: None,
            last_renewed: None,
        })
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn LeadershipCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Watch the coordinator's state.
    pub fn subscribe_state(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    /// Run the election on a new task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run the election until `cancel` fires.
    ///
    /// Store failures are retried at the configured cadence and never end the
    /// loop. On cancellation while leading, the lease is released once if
    /// `release_on_cancel` is set.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            lease = %self.lock.describe(),
            identity = %self.identity,
            "Starting leader election"
        );

        loop {
            if !self.acquire(&cancel).await {
                break;
            }

            self.callbacks.on_started_leading();

            match self.renew(&cancel).await {
                RenewOutcome::Lost => {
                    tracing::warn!(lease = %self.lock.describe(), "Lost leadership");
                    self.last_renewed = None;
                    if self.reported.as_deref() == Some(self.identity.as_str()) {
                        self.report(None);
                    }
                    self.callbacks.on_stopped_leading();
                }
                RenewOutcome::Cancelled => {
                    if self.config.release_on_cancel {
                        self.release().await;
                    }
                    self.callbacks.on_stopped_leading();
                    break;
                }
            }
        }

        self.set_state(ElectionState::Idle);
        tracing::info!(lease = %self.lock.describe(), "Leader election stopped");
    }

    /// Loop until the lease is held. Returns `false` if cancelled first.
    async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        self.set_state(ElectionState::Acquiring);
        loop {
            let started = Instant::now();
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                attempt = self.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Attempt::Held => {
                    tracing::info!(lease = %self.lock.describe(), "Successfully acquired lease");
                    self.last_renewed = Some(started);
                    self.set_state(ElectionState::Leading);
                    return true;
                }
                Attempt::HeldByOther => self.set_state(ElectionState::Observing),
                Attempt::Failed => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Keep renewing while leading.
    ///
    /// Every renewal must land within `renew_deadline` of the previous
    /// successful one; otherwise leadership is given up before the lease can
    /// expire for anyone else.
    async fn renew(&mut self, cancel: &CancellationToken) -> RenewOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                _ = sleep(self.config.retry_period) => {}
            }

            let Some(last) = self.last_renewed else {
                return RenewOutcome::Lost;
            };
            let deadline = last + self.config.renew_deadline;

            loop {
                if Instant::now() >= deadline {
                    tracing::warn!(
                        renew_deadline = ?self.config.renew_deadline,
                        "Failed to renew lease before deadline"
                    );
                    return RenewOutcome::Lost;
                }

                let started = Instant::now();
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                    attempt = timeout_at(deadline, self.try_acquire_or_renew()) => attempt,
                };

                match attempt {
                    Ok(Attempt::Held) => {
                        self.last_renewed = Some(started);
                        tracing::debug!(lease = %self.lock.describe(), "Renewed lease");
                        break;
                    }
                    Ok(Attempt::HeldByOther) => {
                        tracing::warn!(
                            leader = ?self.reported,
                            "Lease was taken over by another holder"
                        );
                        return RenewOutcome::Lost;
                    }
                    Ok(Attempt::Failed) => {
                        let next = (Instant::now() + self.config.retry_period).min(deadline);
                        tokio::select! {
                            _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                            _ = sleep_until(next) => {}
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            renew_deadline = ?self.config.renew_deadline,
                            "Renewal did not complete before deadline"
                        );
                        return RenewOutcome::Lost;
                    }
                }
            }
        }
    }

    /// One read-then-write round: claim a free or expired lease, renew our own,
    /// or report that another holder's lease is still valid.
    async fn try_acquire_or_renew(&mut self) -> Attempt {
        let current = match self.lock.get().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, lease = %self.lock.describe(), "Failed to read lease");
                return Attempt::Failed;
            }
        };

        let Some(current) = current else {
            let record = self.claim(None);
            return match self.lock.create(&record).await {
                Ok(stored) => {
                    self.observe(stored);
                    self.report(Some(self.identity.to_string()));
                    Attempt::Held
                }
                Err(LockError::AlreadyExists) => {
                    tracing::debug!("Lease was created by another contender");
                    Attempt::Failed
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create lease");
                    Attempt::Failed
                }
            };
        };

        self.observe(current.clone());

        if current.has_holder()
            && !current.is_held_by(self.identity.as_str())
            && self.observed_lease_valid()
        {
            self.report(current.holder().map(str::to_string));
            return Attempt::HeldByOther;
        }

        let record = self.claim(Some(&current));
        match self.lock.update(&record, &current.version).await {
            Ok(stored) => {
                self.observe(stored);
                self.report(Some(self.identity.to_string()));
                Attempt::Held
            }
            Err(LockError::Conflict) => {
                tracing::debug!("Lease changed while updating");
                Attempt::Failed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to update lease");
                if !current.is_held_by(self.identity.as_str()) {
                    self.report(current.holder().map(str::to_string));
                }
                Attempt::Failed
            }
        }
    }

    /// Record for claiming or renewing, based on the current stored record.
    fn claim(&self, current: Option<&LeaseRecord>) -> LeaseRecord {
        let now = Utc::now();
        let mut record = LeaseRecord {
            name: self.lock.name().to_string(),
            scope: self.lock.scope().to_string(),
            holder_identity: self.identity.to_string(),
            acquire_time: now,
            renew_time: now,
            duration: self.config.lease_duration,
            transitions: 0,
            version: String::new(),
        };
        if let Some(current) = current {
            record.version = current.version.clone();
            if current.is_held_by(self.identity.as_str()) {
                record.acquire_time = current.acquire_time;
                record.transitions = current.transitions;
            } else {
                record.transitions = current.transitions.saturating_add(1);
            }
        }
        record
    }

    /// Best-effort single write clearing the holder.
    async fn release(&mut self) {
        self.set_state(ElectionState::Releasing);

        let Some(observed) = self.observed.as_ref() else {
            return;
        };
        if !observed.record.is_held_by(self.identity.as_str()) {
            return;
        }

        let now = Utc::now();
        let record = LeaseRecord {
            holder_identity: String::new(),
            acquire_time: now,
            renew_time: now,
            duration: RELEASED_LEASE_DURATION,
            ..observed.record.clone()
        };
        let expected = observed.record.version.clone();

        match self.lock.update(&record, &expected).await {
            Ok(stored) => {
                tracing::info!(lease = %self.lock.describe(), "Released lease");
                self.observe(stored);
                self.report(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, lease = %self.lock.describe(), "Failed to release lease");
            }
        }
    }

    /// Remember a record, restarting the validity clock when its version changed.
    fn observe(&mut self, record: LeaseRecord) {
        let changed = self
            .observed
            .as_ref()
            .is_none_or(|o| o.record.version != record.version);
        if changed {
            self.observed = Some(Observation {
                record,
                at: Instant::now(),
            });
        }
    }

    fn observed_lease_valid(&self) -> bool {
        self.observed
            .as_ref()
            .is_some_and(|o| o.at + o.record.duration > Instant::now())
    }

    /// Publish a leadership event if the leader differs from the last one published.
    fn report(&mut self, leader: Option<String>) {
        if self.reported == leader {
            return;
        }
        tracing::info!(leader = leader.as_deref().unwrap_or(""), "New leader");
        self.reported = leader.clone();
        self.events.publish(LeadershipEvent::new(leader));
    }

    fn set_state(&self, state: ElectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Election state changed");
            *current = state;
            true
        });
    }
}

/// `period` stretched by a random factor in `[1, 1 + JITTER_FACTOR)`.
fn jittered(period: Duration) -> Duration {
    period.mul_f64(1.0 + rand::random::<f64>() * JITTER_FACTOR)
}
