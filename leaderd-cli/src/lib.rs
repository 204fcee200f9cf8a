//! leaderd: lease-based leader election with an HTTP status endpoint.
//!
//! Each replica runs an [`leaderd_election::ElectionCoordinator`] against a
//! shared lease and serves:
//!
//! - `GET /healthz`, `GET /readyz`: `ok` while serving, 503 once draining
//! - `GET /api/leader`: `{"leader": "<identity>"}`, empty when unknown
//!
//! On SIGTERM or SIGINT the status server drains for a bounded grace period
//! and the lease is released if held.

pub mod app;
pub mod cli;
pub mod server;
pub mod shutdown;

pub use app::{run, AppError, LoggingCallbacks};
pub use cli::{AppConfig, Cli, ConfigError};
pub use server::{ServerError, ServerHandle, ServerPhase, StatusServer, StatusState};
pub use shutdown::ShutdownOrchestrator;
