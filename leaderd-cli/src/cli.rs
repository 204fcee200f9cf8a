//! Command-line flags and their conversion into an [`AppConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use leaderd_election::{
    ElectionConfig, ElectionError, HolderIdentity, DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE,
    DEFAULT_RETRY_PERIOD,
};
use thiserror::Error;

/// Address the status server binds when `--addr` is not given.
pub const DEFAULT_ADDR: &str = ":4040";

/// How long in-flight HTTP requests may run once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// leaderd - lease-based leader election with an HTTP status endpoint
///
/// Competes for a Kubernetes Lease and reports the current leader on
/// `/api/leader`.
#[derive(Parser, Debug)]
#[command(name = "leaderd")]
#[command(version)]
#[command(about = "Lease-based leader election with an HTTP status endpoint")]
pub struct Cli {
    /// Holder identity of this replica (default: a random UUID)
    #[arg(long)]
    pub id: Option<String>,

    /// Name of the lease object to compete for
    #[arg(long)]
    pub lease_name: Option<String>,

    /// How long a lease stays valid after it is written
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub lease_duration: Duration,

    /// How long the leader retries a renewal before stepping down
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub lease_renew_duration: Duration,

    /// Namespace of the lease object
    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Path to a kubeconfig file (empty: use in-cluster credentials)
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// Address of the HTTP status server
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Enable debug output to stderr
    #[arg(short, long)]
    pub debug: bool,
}

/// Errors turning flags into an [`AppConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required flag --lease-name")]
    MissingLeaseName,

    #[error(transparent)]
    Election(#[from] ElectionError),
}

/// Immutable process configuration, built once from the flags.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: HolderIdentity,
    pub lease_name: String,
    pub namespace: String,
    /// `None` means in-cluster credentials
    pub kubeconfig: Option<PathBuf>,
    /// Bind address, `host:port` or `:port` for every interface
    pub addr: String,
    pub election: ElectionConfig,
    pub grace_period: Duration,
}

impl Cli {
    /// Validate the flags and build the configuration.
    ///
    /// The default identity is generated here, once.
    pub fn into_config(self) -> Result<AppConfig, ConfigError> {
        let lease_name = match self.lease_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ConfigError::MissingLeaseName),
        };

        let identity = match self.id {
            Some(id) => HolderIdentity::new(id)?,
            None => HolderIdentity::new(uuid::Uuid::new_v4().to_string())?,
        };

        let kubeconfig = (!self.kubeconfig.is_empty()).then(|| PathBuf::from(self.kubeconfig));

        let election = ElectionConfig::new()
            .with_lease_duration(self.lease_duration)
            .with_renew_deadline(self.lease_renew_duration)
            .with_retry_period(DEFAULT_RETRY_PERIOD)
            .with_release_on_cancel(true);

        Ok(AppConfig {
            identity,
            lease_name,
            namespace: self.namespace,
            kubeconfig,
            addr: self.addr,
            election,
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }
}

impl AppConfig {
    /// A configuration with default timings, for embedding and tests.
    pub fn new(identity: HolderIdentity, lease_name: impl Into<String>) -> Self {
        Self {
            identity,
            lease_name: lease_name.into(),
            namespace: "default".to_string(),
            kubeconfig: None,
            addr: DEFAULT_ADDR.to_string(),
            election: ElectionConfig::new()
                .with_lease_duration(DEFAULT_LEASE_DURATION)
                .with_renew_deadline(DEFAULT_RENEW_DEADLINE)
                .with_retry_period(DEFAULT_RETRY_PERIOD),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Parse a duration such as `10s`, `500ms`, `1m30s` or `1.5h`.
///
/// Accepted units are `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`. A bare `0` is
/// allowed; any other number needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            "" => return Err(format!("invalid duration '{input}': missing unit")),
            other => return Err(format!("invalid duration '{input}': unknown unit '{other}'")),
        };

        let bad_number = || format!("invalid duration '{input}': bad number '{number}'");
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(bad_number());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| bad_number())?
        };
        let mut nanos = whole.checked_mul(unit_nanos).ok_or_else(bad_number)?;
        if !fraction.is_empty() {
            let digits = u32::try_from(fraction.len()).map_err(|_| bad_number())?;
            let scale = 10u128.checked_pow(digits).ok_or_else(bad_number)?;
            let fraction: u128 = fraction.parse().map_err(|_| bad_number())?;
            nanos += fraction.checked_mul(unit_nanos).ok_or_else(bad_number)? / scale;
        }

        total_nanos = total_nanos.checked_add(nanos).ok_or_else(bad_number)?;
        rest = tail;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| format!("invalid duration '{input}': out of range"))?;
    // Remainder of a division by 10^9 always fits
    let subsec = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, subsec))
}
