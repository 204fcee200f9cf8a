//! Signal handling and the ordered shutdown of the server and the election.

use std::io;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::{ServerError, ServerHandle};

/// Cancels a shared token on the first termination signal, then stops the
/// status server within a grace period and waits for the election to finish.
#[derive(Debug, Clone)]
pub struct ShutdownOrchestrator {
    cancel: CancellationToken,
    grace_period: Duration,
}

impl ShutdownOrchestrator {
    pub fn new(cancel: CancellationToken, grace_period: Duration) -> Self {
        Self {
            cancel,
            grace_period,
        }
    }

    /// The token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Begin shutdown. Calling this more than once has no further effect.
    pub fn trigger(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            tracing::info!(reason, "Shutdown already in progress, ignoring");
            return;
        }
        tracing::warn!(reason, "Shutting down");
        self.cancel.cancel();
    }

    /// Install SIGTERM and SIGINT handlers and trigger shutdown on each signal.
    ///
    /// Handlers are registered before this returns, so a signal delivered
    /// afterwards is never lost. The listener keeps running so repeated
    /// signals are absorbed instead of killing the process.
    pub fn spawn_signal_listener(&self) -> io::Result<JoinHandle<()>> {
        let mut signals = TerminationSignals::new()?;
        let orchestrator = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let signal = signals.recv().await;
                orchestrator.trigger(signal);
            }
        }))
    }

    /// Run until shutdown completes.
    ///
    /// Waits for the token to be cancelled (or the server to fail on its own),
    /// gives the server up to the grace period to drain, then waits for the
    /// election task, which releases the lease if held.
    pub async fn run(
        &self,
        election: JoinHandle<()>,
        mut server: ServerHandle,
    ) -> Result<(), ServerError> {
        let failure = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = server.stopped() => Some(match result {
                Ok(()) => ServerError::ClosedUnexpectedly,
                Err(e) => e,
            }),
        };

        if let Some(e) = &failure {
            tracing::error!(error = %e, "Status server stopped unexpectedly");
            self.trigger("status server failure");
        }

        if let Err(e) = server.shutdown(self.grace_period).await {
            tracing::error!(error = %e, "Status server shutdown failed");
        }

        if let Err(e) = election.await {
            tracing::error!(error = %e, "Election task failed");
        }

        tracing::info!("Shutdown complete");
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(unix)]
struct TerminationSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}
