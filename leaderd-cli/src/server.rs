//! HTTP status server: health checks and the current leader.
//!
//! The server moves through three phases:
//!
//! ```text
//! Serving --(shutdown requested)--> Draining --(drained / grace expired)--> Stopped
//! ```
//!
//! Health checks answer 200 only while serving. The leader field is written by
//! a single updater task fed from the leadership channel and read by every
//! request handler.
//!
//! Every accepted connection runs on its own task in a [`JoinSet`] owned by
//! the accept loop. Draining asks each connection to finish its current
//! request; connections still open when the grace period ends are aborted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use leaderd_election::LeadershipReceiver;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Pause after an accept error that is not specific to one connection.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors from binding or running the status server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind status server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("status server closed before shutdown was requested")]
    ClosedUnexpectedly,

    #[error("status server task failed: {0}")]
    Task(String),
}

/// Lifecycle phase of the status server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Serving,
    /// No new connections; in-flight requests may finish
    Draining,
    Stopped,
}

/// Inputs to the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    ShutdownRequested,
    /// All connections finished within the grace period
    Drained,
    /// Remaining connections were closed at the end of the grace period
    GraceExpired,
    /// The serve loop ended on its own
    Exited,
}

impl ServerPhase {
    /// The phase reached by applying `event`, or `None` if it does not apply.
    pub fn next(self, event: PhaseEvent) -> Option<ServerPhase> {
        use PhaseEvent::*;
        use ServerPhase::*;

        match (self, event) {
            (Serving, ShutdownRequested) => Some(Draining),
            (Draining, Drained | GraceExpired | Exited) => Some(Stopped),
            (Serving, Exited) => Some(Stopped),
            _ => None,
        }
    }
}

/// State shared between the request handlers and the leader updater.
#[derive(Debug)]
pub struct StatusState {
    leader: RwLock<String>,
    phase: watch::Sender<ServerPhase>,
}

impl Default for StatusState {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(ServerPhase::Serving);
        Self {
            leader: RwLock::new(String::new()),
            phase,
        }
    }

    /// Current leader identity, empty when unknown.
    pub async fn leader(&self) -> String {
        self.leader.read().await.clone()
    }

    pub async fn set_leader(&self, leader: &str) {
        let mut current = self.leader.write().await;
        if *current != leader {
            tracing::info!(leader = %leader, "Leader changed");
            *current = leader.to_string();
        }
    }

    pub fn phase(&self) -> ServerPhase {
        *self.phase.borrow()
    }

    /// Apply `event` to the phase; events that do not apply are ignored.
    pub fn apply(&self, event: PhaseEvent) -> ServerPhase {
        self.phase.send_if_modified(|phase| match phase.next(event) {
            Some(next) => {
                tracing::debug!(from = ?*phase, to = ?next, ?event, "Status server phase changed");
                *phase = next;
                true
            }
            None => false,
        });
        self.phase()
    }
}

#[derive(Debug, Serialize)]
struct LeaderResponse {
    leader: String,
}

/// Build the status routes over `state`.
pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/healthz", any(health))
        .route("/readyz", any(health))
        .route("/api/leader", any(leader))
        .with_state(state)
}

async fn health(method: Method, State(state): State<Arc<StatusState>>) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.phase() {
        ServerPhase::Serving => (StatusCode::OK, "ok\n").into_response(),
        ServerPhase::Draining | ServerPhase::Stopped => {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting down\n").into_response()
        }
    }
}

async fn leader(method: Method, State(state): State<Arc<StatusState>>) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(LeaderResponse {
        leader: state.leader().await,
    })
    .into_response()
}

/// Apply leadership events to `state` until the channel closes or `cancel` fires.
pub fn spawn_leader_updater(
    state: Arc<StatusState>,
    mut leaders: LeadershipReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = leaders.recv() => match event {
                    Some(event) => state.set_leader(event.leader_or_empty()).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Leader updater stopped");
    })
}

/// A bound, not yet serving, status server.
pub struct StatusServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<StatusState>,
}

impl StatusServer {
    /// Bind the listener. `addr` is `host:port`; port 0 picks a free port.
    ///
    /// `:port` binds every interface: the IPv6 wildcard, which also accepts
    /// IPv4 where the OS allows dual-stack sockets, or `0.0.0.0` on hosts
    /// without IPv6.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = match addr.strip_prefix(':') {
            Some(port) => match TcpListener::bind(format!("[::]:{port}")).await {
                Ok(listener) => listener,
                Err(e) if e.kind() != io::ErrorKind::AddrInUse => {
                    tracing::debug!(error = %e, "IPv6 wildcard unavailable, binding IPv4 only");
                    TcpListener::bind(format!("0.0.0.0:{port}"))
                        .await
                        .map_err(bind_error)?
                }
                Err(e) => return Err(bind_error(e)),
            },
            None => TcpListener::bind(addr).await.map_err(bind_error)?,
        };
        let local_addr = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(StatusState::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<StatusState> {
        self.state.clone()
    }

    /// Start serving. Cancelling `cancel` stops accepting connections and
    /// moves the server to [`ServerPhase::Draining`].
    pub fn start(self, cancel: CancellationToken) -> ServerHandle {
        let force_close = CancellationToken::new();
        let task = tokio::spawn(serve(
            self.listener,
            router(self.state.clone()),
            self.state.clone(),
            cancel,
            force_close.clone(),
        ));

        ServerHandle {
            task: Some(task),
            force_close,
            state: self.state,
        }
    }
}

/// Accept errors that concern a single connection, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Accept until `cancel`, then drain until every connection is done or
/// `force_close` aborts the rest. Returns how the drain ended.
async fn serve(
    listener: TcpListener,
    app: Router,
    state: Arc<StatusState>,
    cancel: CancellationToken,
    force_close: CancellationToken,
) -> PhaseEvent {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = force_close.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, app.clone(), cancel.clone()));
                }
                Err(e) if is_connection_error(&e) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            },
        }
    }

    drop(listener);
    state.apply(PhaseEvent::ShutdownRequested);
    tracing::info!(connections = connections.len(), "Status server draining");

    loop {
        tokio::select! {
            biased;
            _ = force_close.cancelled() => {
                connections.shutdown().await;
                return PhaseEvent::GraceExpired;
            }
            next = connections.join_next() => {
                if next.is_none() {
                    return PhaseEvent::Drained;
                }
            }
        }
    }
}

/// Serve HTTP/1 on one connection, finishing the current request and closing
/// once `cancel` fires.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    cancel: CancellationToken,
) {
    let service = service_fn(move |request: Request<Incoming>| app.clone().oneshot(request));
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}

/// A running status server.
pub struct ServerHandle {
    task: Option<JoinHandle<PhaseEvent>>,
    force_close: CancellationToken,
    state: Arc<StatusState>,
}

impl ServerHandle {
    /// Wait for the serve loop to end, for whatever reason.
    pub async fn stopped(&mut self) -> Result<(), ServerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        self.state.apply(PhaseEvent::Exited);
        join_result(result).map(|_| ())
    }

    /// Wait up to `grace_period` for connections to drain, then abort the
    /// ones still open.
    ///
    /// Meant to be called after the cancellation token passed to
    /// [`StatusServer::start`] has fired. A server that already stopped is
    /// not an error.
    pub async fn shutdown(&mut self, grace_period: Duration) -> Result<(), ServerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let result = match tokio::time::timeout(grace_period, &mut *task).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    grace_period = ?grace_period,
                    "Grace period elapsed, closing remaining connections"
                );
                self.force_close.cancel();
                task.await
            }
        };
        self.task = None;

        let event = join_result(result)?;
        self.state.apply(event);
        Ok(())
    }
}

fn join_result(result: Result<PhaseEvent, JoinError>) -> Result<PhaseEvent, ServerError> {
    result.map_err(|e| ServerError::Task(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaderd_election::{leadership_channel, LeadershipEvent};

    #[test]
    fn test_phase_transitions() {
        use PhaseEvent::*;
        use ServerPhase::*;

        assert_eq!(Serving.next(ShutdownRequested), Some(Draining));
        assert_eq!(Draining.next(Drained), Some(Stopped));
        assert_eq!(Draining.next(GraceExpired), Some(Stopped));
        assert_eq!(Serving.next(Exited), Some(Stopped));

        assert_eq!(Draining.next(ShutdownRequested), None);
        assert_eq!(Serving.next(Drained), None);
        assert_eq!(Stopped.next(ShutdownRequested), None);
        assert_eq!(Stopped.next(Exited), None);
    }

    #[test]
    fn test_apply_ignores_repeated_shutdown() {
        let state = StatusState::new();
        assert_eq!(state.apply(PhaseEvent::ShutdownRequested), ServerPhase::Draining);
        assert_eq!(state.apply(PhaseEvent::ShutdownRequested), ServerPhase::Draining);
        assert_eq!(state.apply(PhaseEvent::Drained), ServerPhase::Stopped);
    }

    #[tokio::test]
    async fn test_health_by_phase_and_method() {
        let state = Arc::new(StatusState::new());

        let response = health(Method::GET, State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok\n");

        let response = health(Method::POST, State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.apply(PhaseEvent::ShutdownRequested);
        let response = health(Method::GET, State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_leader_body() {
        let state = Arc::new(StatusState::new());

        let response = leader(Method::GET, State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"leader": ""}));

        state.set_leader("pod-a").await;
        let response = leader(Method::GET, State(state.clone())).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"leader": "pod-a"}));

        let response = leader(Method::DELETE, State(state)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_leader_updater_applies_latest_event() {
        let state = Arc::new(StatusState::new());
        let (events, leaders) = leadership_channel();
        let cancel = CancellationToken::new();
        let updater = spawn_leader_updater(state.clone(), leaders, cancel.clone());

        events.publish(LeadershipEvent::new(Some("pod-a".to_string())));
        events.publish(LeadershipEvent::new(Some("pod-b".to_string())));
        drop(events);
        updater.await.unwrap();

        assert_eq!(state.leader().await, "pod-b");
    }

    #[tokio::test]
    async fn test_leader_updater_stops_on_cancel() {
        let state = Arc::new(StatusState::new());
        let (_events, leaders) = leadership_channel();
        let cancel = CancellationToken::new();
        let updater = spawn_leader_updater(state, leaders, cancel.clone());

        cancel.cancel();
        updater.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_after_stop_is_not_an_error() {
        let server = StatusServer::bind("127.0.0.1:0").await.unwrap();
        let state = server.state();
        let cancel = CancellationToken::new();
        let mut handle = server.start(cancel.clone());

        cancel.cancel();
        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state.phase(), ServerPhase::Stopped);
        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_half_sent_request_is_cut_off_at_grace_period() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = StatusServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let state = server.state();
        let cancel = CancellationToken::new();
        let mut handle = server.start(cancel.clone());

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        let started = std::time::Instant::now();
        handle.shutdown(Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state.phase(), ServerPhase::Stopped);

        // Finishing the request now must not get an answer.
        let _ = stalled.write_all(b"\r\n").await;
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(2), stalled.read(&mut buf))
            .await
            .expect("connection left open after the grace period");
        assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {read:?}");
    }

    #[tokio::test]
    async fn test_idle_keep_alive_connection_drains_quickly() {
        let server = StatusServer::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let cancel = CancellationToken::new();
        let mut handle = server.start(cancel.clone());

        let client = reqwest::Client::new();
        let response = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok\n");

        cancel.cancel();
        let started = std::time::Instant::now();
        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_bind_port_only_listens_on_all_interfaces() {
        let server = StatusServer::bind(":0").await.unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert!(server.local_addr().ip().is_unspecified());

        let cancel = CancellationToken::new();
        let mut handle = server.start(cancel.clone());
        let body = reqwest::get(format!("http://localhost:{port}/api/leader"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, r#"{"leader":""}"#);

        cancel.cancel();
        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let server = StatusServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let err = StatusServer::bind(&addr).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
