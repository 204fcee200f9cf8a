//! Startup wiring: election, status server and shutdown.

use std::sync::Arc;

use leaderd_election::{
    leadership_channel, ElectionCoordinator, ElectionError, LeaseLock, LeadershipCallbacks,
};
use thiserror::Error;

use crate::cli::AppConfig;
use crate::server::{spawn_leader_updater, ServerError, StatusServer};
use crate::shutdown::ShutdownOrchestrator;

/// Errors that end the process with a non-zero exit code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize leader election: {0}")]
    Election(#[from] ElectionError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Logs leadership changes of this process.
#[derive(Debug, Clone)]
pub struct LoggingCallbacks {
    identity: String,
}

impl LoggingCallbacks {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

impl LeadershipCallbacks for LoggingCallbacks {
    fn on_started_leading(&self) {
        tracing::info!(identity = %self.identity, "Started leading");
    }

    fn on_stopped_leading(&self) {
        tracing::info!(identity = %self.identity, "Stopped leading");
    }
}

/// Run the election and the status server until `orchestrator` shuts down.
///
/// The coordinator is created before the listener is bound, so an invalid
/// election configuration never opens a port.
pub async fn run(
    config: AppConfig,
    lock: Arc<dyn LeaseLock>,
    orchestrator: ShutdownOrchestrator,
) -> Result<(), AppError> {
    let (events, leaders) = leadership_channel();
    let coordinator = ElectionCoordinator::new(lock, config.identity.clone(), config.election, events)?
        .with_callbacks(Arc::new(LoggingCallbacks::new(config.identity.as_str())));

    let server = StatusServer::bind(&config.addr).await?;
    tracing::info!(addr = %server.local_addr(), "Status server listening");

    let cancel = orchestrator.token();
    let election = coordinator.spawn(cancel.clone());
    let updater = spawn_leader_updater(server.state(), leaders, cancel.clone());
    let handle = server.start(cancel);

    let result = orchestrator.run(election, handle).await;
    if let Err(e) = updater.await {
        tracing::error!(error = %e, "Leader updater failed");
    }
    result.map_err(AppError::Server)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use leaderd_election::{ElectionConfig, HolderIdentity, InMemoryLeaseLock};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_invalid_election_config_is_fatal() {
        let config = AppConfig::new(HolderIdentity::new("pod-a").unwrap(), "my-lease")
            .with_addr("127.0.0.1:0")
            .with_election(
                ElectionConfig::new()
                    .with_lease_duration(Duration::from_secs(5))
                    .with_renew_deadline(Duration::from_secs(10)),
            );
        let lock = Arc::new(InMemoryLeaseLock::new("my-lease", "default"));
        let orchestrator = ShutdownOrchestrator::new(CancellationToken::new(), Duration::ZERO);

        let err = run(config, lock.clone(), orchestrator).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Election(ElectionError::LeaseDurationTooShort { .. })
        ));
        assert_eq!(lock.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let config =
            AppConfig::new(HolderIdentity::new("pod-a").unwrap(), "my-lease").with_addr(addr);
        let lock = Arc::new(InMemoryLeaseLock::new("my-lease", "default"));
        let orchestrator = ShutdownOrchestrator::new(CancellationToken::new(), Duration::ZERO);

        let err = run(config, lock, orchestrator).await.unwrap_err();
        assert!(matches!(err, AppError::Server(ServerError::Bind { .. })));
    }
}
