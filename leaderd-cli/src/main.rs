//! leaderd command-line entry point.
//!
//! Exit codes:
//! - 0: Clean shutdown
//! - 1: Missing or invalid flags, client or election setup failure, or a
//!   fatal serving error

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use leaderd::{AppConfig, Cli, ShutdownOrchestrator};
use leaderd_election::{ClientConfig, KubernetesLeaseLock, LeaseLock};
use tokio_util::sync::CancellationToken;

mod exit_codes;
mod logging;

use exit_codes::{EXIT_ERROR, EXIT_SUCCESS};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return EXIT_ERROR;
        }
    };

    let lock = match build_lock(&config) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("{:#}", e);
            return EXIT_ERROR;
        }
    };

    let orchestrator = ShutdownOrchestrator::new(CancellationToken::new(), config.grace_period);
    if let Err(e) = orchestrator.spawn_signal_listener() {
        tracing::error!(error = %e, "Failed to install signal handlers");
        return EXIT_ERROR;
    }

    tracing::info!(
        identity = %config.identity,
        lease = %config.lease_name,
        namespace = %config.namespace,
        addr = %config.addr,
        "Starting leaderd"
    );

    match leaderd::run(config, lock, orchestrator).await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            EXIT_ERROR
        }
    }
}

/// Build the Kubernetes lease lock from a kubeconfig or in-cluster credentials.
fn build_lock(config: &AppConfig) -> anyhow::Result<Arc<dyn LeaseLock>> {
    let client = ClientConfig::resolve(config.kubeconfig.as_deref())
        .context("failed to load Kubernetes client configuration")?;
    let lock = KubernetesLeaseLock::new(&client, &config.lease_name, &config.namespace)
        .context("failed to build Kubernetes client")?;
    Ok(Arc::new(lock))
}
