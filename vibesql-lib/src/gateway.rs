//! The HTTP query gateway: terminate HTTP on `POST /v1/query`, run the
//! request pipeline, and enforce the accept cap and shutdown budget.

pub mod wire;

mod limit;

use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::timeout::TimeoutLayer;

use crate::query::{validate, ExecutionResult, QueryError, QueryExecutor};
use limit::GuardedStream;
use wire::{FailureEnvelope, QueryRequest, SuccessEnvelope};

/// If set and non-empty, the gateway binds to this host instead of
/// loopback. The single escape hatch for LAN use.
pub static BIND_HOST_ENV: &str = "VIBESQL_HOST";

pub static DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// The fixed TCP port of the query surface.
pub const PORT: u16 = 5173;

/// At most this many sockets are served concurrently. Further connections
/// queue in the accept layer; they are not rejected.
pub const ACCEPT_CAP: usize = 2;

/// Bounds servicing of one request, body read included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounds a stalled socket write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounds an idle kept-alive connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// In-flight requests get this long to drain on shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
/// How often the disconnect watchdog re-probes a socket that still has
/// request bytes pending.
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Bind host; `None` falls back to [`BIND_HOST_ENV`], then loopback.
    pub host: Option<String>,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { host: None, port: PORT }
    }
}

impl GatewayConfig {
    fn bind_host(&self) -> String {
        self.host
            .clone()
            .or_else(|| env::var(BIND_HOST_ENV).ok().filter(|host| !host.is_empty()))
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_owned())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is already running")]
    AlreadyRunning,
    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    executor: Arc<dyn QueryExecutor>,
}

/// Cancelled by the connection's watchdog when the peer goes away.
/// Injected into each request so the pipeline can be raced against it.
#[derive(Clone)]
struct Disconnect(CancellationToken);

struct ServeHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    acceptor: JoinHandle<()>,
}

/// The HTTP front of the query surface.
///
/// `start` binds the listener and begins serving; `stop` requests a
/// graceful shutdown bounded by [`SHUTDOWN_BUDGET`]. The readiness flag is
/// the one lock-free piece of state: true between `start` and `stop`.
pub struct Gateway {
    config: GatewayConfig,
    executor: Arc<dyn QueryExecutor>,
    ready: AtomicBool,
    serving: Mutex<Option<ServeHandle>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        Self { config, executor, ready: AtomicBool::new(false), serving: Mutex::new(None) }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// The bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.serving.lock().expect("gateway lock poisoned").as_ref().map(|handle| handle.addr)
    }

    /// Bind and begin serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let host = self.config.bind_host();
        let listener = TcpListener::bind((host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;

        let mut serving = self.serving.lock().expect("gateway lock poisoned");
        if serving.is_some() {
            return Err(GatewayError::AlreadyRunning);
        }
        let router = build_router(AppState { executor: self.executor.clone() });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor =
            tokio::spawn(accept_loop(listener, router, cancel.clone(), tracker.clone()));
        *serving = Some(ServeHandle { addr, cancel, tracker, acceptor });
        self.ready.store(true, Ordering::SeqCst);
        log::info!("query gateway listening on {addr}");
        Ok(addr)
    }

    /// Stop accepting and drain in-flight requests within the budget.
    /// Idempotent.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        self.ready.store(false, Ordering::SeqCst);
        let handle = self.serving.lock().expect("gateway lock poisoned").take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.cancel.cancel();
        let _ = handle.acceptor.await;
        handle.tracker.close();
        if tokio::time::timeout(SHUTDOWN_BUDGET, handle.tracker.wait()).await.is_err() {
            log::warn!("connections still open after {SHUTDOWN_BUDGET:?}; abandoning drain");
        }
        log::info!("query gateway stopped");
        Ok(())
    }

    /// Block until an interrupt or terminate signal arrives, then stop.
    pub async fn wait_for_shutdown(&self) -> Result<(), GatewayError> {
        shutdown_signal().await?;
        log::info!("shutdown signal received");
        self.stop().await
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/query", post(handle_query).fallback(handle_bad_method))
        .fallback(handle_unknown_path)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// `decode → validate → execute → encode`, each error short-circuiting to
/// the failure envelope. The whole pipeline races the connection's
/// disconnect token: a peer that goes away cancels the in-flight
/// statement, which surfaces as a query timeout.
async fn handle_query(
    State(state): State<AppState>,
    Extension(Disconnect(disconnect)): Extension<Disconnect>,
    body: Bytes,
) -> Response {
    tokio::select! {
        outcome = run_pipeline(&state, &body) => match outcome {
            Ok(result) => success_response(result),
            Err(error) => failure_response(&error),
        },
        () = disconnect.cancelled() => {
            log::debug!("client went away; cancelling the in-flight statement");
            failure_response(&QueryError::timeout())
        }
    }
}

async fn run_pipeline(state: &AppState, body: &[u8]) -> Result<ExecutionResult, QueryError> {
    let request: QueryRequest = serde_json::from_slice(body).map_err(|error| {
        QueryError::invalid_sql("Request body must be a JSON object with an \"sql\" string")
            .with_detail(error.to_string())
    })?;
    let sql = request.sql.unwrap_or_default();
    validate::validate(&sql)?;
    state.executor.execute(&sql).await
}

async fn handle_bad_method() -> Response {
    failure_response(&QueryError::invalid_sql(
        "Only the POST method is accepted on /v1/query",
    ))
}

async fn handle_unknown_path() -> Response {
    failure_response(&QueryError::invalid_sql("The only endpoint is POST /v1/query"))
}

fn success_response(result: ExecutionResult) -> Response {
    (StatusCode::OK, Json(SuccessEnvelope::from(result))).into_response()
}

fn failure_response(error: &QueryError) -> Response {
    let status = StatusCode::from_u16(error.kind.status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(FailureEnvelope::from(error))).into_response()
}

/// Accept connections, acquiring an accept-cap slot before each accept. The
/// slot travels with the accepted socket and frees on its close.
async fn accept_loop(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let slots = Arc::new(Semaphore::new(ACCEPT_CAP));
    loop {
        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (stream, _remote) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    log::warn!("accept failed: {error}");
                    continue;
                }
            },
        };
        tracker.spawn(serve_connection(stream, permit, router.clone(), cancel.clone()));
    }
}

/// Serve one accepted socket.
///
/// A watchdog shares the socket and trips the disconnect token when the
/// peer closes or resets the connection, so an in-flight statement is
/// cancelled rather than running on with nobody left to answer.
async fn serve_connection(
    stream: TcpStream,
    permit: OwnedSemaphorePermit,
    router: Router,
    cancel: CancellationToken,
) {
    let socket = Arc::new(stream);
    let disconnect = CancellationToken::new();
    let watchdog = tokio::spawn({
        let socket = socket.clone();
        let disconnect = disconnect.clone();
        async move {
            watch_for_disconnect(&socket).await;
            disconnect.cancel();
        }
    });

    let io = GuardedStream::new(socket, permit, IDLE_TIMEOUT, WRITE_TIMEOUT);
    let service = TowerToHyperService::new(router.layer(Extension(Disconnect(disconnect))));
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(error) = result {
                    log::debug!("connection ended: {error}");
                }
                break;
            }
            () = cancel.cancelled(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
    watchdog.abort();
}

/// Resolve when the peer has closed or reset the connection.
///
/// `peek` leaves pending request bytes in place; their presence means the
/// peer is still there, so the probe backs off and re-checks instead of
/// consuming them.
async fn watch_for_disconnect(socket: &TcpStream) {
    let mut probe = [0_u8; 1];
    loop {
        match socket.peek(&mut probe).await {
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(DISCONNECT_POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayConfig;

    #[test]
    fn default_config_uses_the_fixed_port() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, super::PORT);
        assert_eq!(config.port, 5173);
        assert!(config.host.is_none());
    }

    #[test]
    fn explicit_host_wins_over_the_default() {
        let config = GatewayConfig { host: Some("0.0.0.0".to_owned()), port: 0 };
        assert_eq!(config.bind_host(), "0.0.0.0");
    }

    #[test]
    fn default_host_is_loopback() {
        // The override variable is absent in the test environment.
        let config = GatewayConfig { host: None, port: 0 };
        if std::env::var(super::BIND_HOST_ENV).is_err() {
            assert_eq!(config.bind_host(), super::DEFAULT_BIND_HOST);
        }
    }
}
