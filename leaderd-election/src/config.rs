//! Election timing configuration and holder identity.

use std::fmt;
use std::time::Duration;

use crate::error::{ElectionError, Result};

/// Maximum extra fraction of `retry_period` added as random jitter between
/// acquisition attempts.
pub const JITTER_FACTOR: f64 = 1.2;

/// Default lease validity window
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);

/// Default time a leader has to refresh its lease
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(5);

/// Default cadence between attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(3);

/// Unique token identifying this process to the lock store.
///
/// Generated or supplied once at startup and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderIdentity(String);

impl HolderIdentity {
    pub fn new(identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ElectionError::EmptyIdentity);
        }
        Ok(Self(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable timing parameters for an election.
///
/// ```
/// use leaderd_election::ElectionConfig;
/// use std::time::Duration;
///
/// let config = ElectionConfig::new()
///     .with_lease_duration(Duration::from_secs(15))
///     .with_renew_deadline(Duration::from_secs(10))
///     .with_release_on_cancel(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectionConfig {
    /// How long a written lease stays valid for observers
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a renewal before stepping down
    pub renew_deadline: Duration,
    /// Cadence of acquire, observe and renew attempts
    pub retry_period: Duration,
    /// Clear the holder on cancellation instead of letting the lease expire
    pub release_on_cancel: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

impl ElectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_renew_deadline(mut self, renew_deadline: Duration) -> Self {
        self.renew_deadline = renew_deadline;
        self
    }

    pub fn with_retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    pub fn with_release_on_cancel(mut self, release_on_cancel: bool) -> Self {
        self.release_on_cancel = release_on_cancel;
        self
    }

    /// Check the timing relationships the coordinator relies on.
    ///
    /// The renew deadline must be shorter than the lease duration so a leader
    /// steps down before its lease can expire for observers, and longer than
    /// one jittered retry so at least one renewal attempt fits inside it.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(ElectionError::ZeroDuration("lease duration"));
        }
        if self.renew_deadline.is_zero() {
            return Err(ElectionError::ZeroDuration("renew deadline"));
        }
        if self.retry_period.is_zero() {
            return Err(ElectionError::ZeroDuration("retry period"));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::LeaseDurationTooShort {
                lease_duration: self.lease_duration,
                renew_deadline: self.renew_deadline,
            });
        }
        let minimum = self.retry_period.mul_f64(JITTER_FACTOR);
        if self.renew_deadline <= minimum {
            return Err(ElectionError::RenewDeadlineTooShort {
                renew_deadline: self.renew_deadline,
                minimum,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ElectionConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(10));
        assert_eq!(config.renew_deadline, Duration::from_secs(5));
        assert_eq!(config.retry_period, Duration::from_secs(3));
        assert!(config.release_on_cancel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_must_outlast_renew_deadline() {
        let config = ElectionConfig::new()
            .with_lease_duration(Duration::from_secs(5))
            .with_renew_deadline(Duration::from_secs(5));
        assert!(matches!(
            config.validate(),
            Err(ElectionError::LeaseDurationTooShort { .. })
        ));
    }

    #[test]
    fn test_renew_deadline_must_fit_a_jittered_retry() {
        let config = ElectionConfig::new()
            .with_renew_deadline(Duration::from_secs(4))
            .with_retry_period(Duration::from_secs(4));
        assert!(matches!(
            config.validate(),
            Err(ElectionError::RenewDeadlineTooShort { .. })
        ));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = ElectionConfig::new().with_retry_period(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ElectionError::ZeroDuration("retry period"))
        ));
    }

    #[test]
    fn test_holder_identity() {
        assert!(matches!(
            HolderIdentity::new(""),
            Err(ElectionError::EmptyIdentity)
        ));
        let id = HolderIdentity::new("pod-a").unwrap();
        assert_eq!(id.as_str(), "pod-a");
        assert_eq!(id.to_string(), "pod-a");
    }
}
