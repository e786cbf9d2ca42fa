//! Drive the gateway over real sockets with stub executors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use vibesql::gateway::{Gateway, GatewayConfig};
use vibesql::query::{ErrorKind, ExecutionResult, QueryError, QueryExecutor};

/// Always answers with one `{"test": 1}` row.
struct CannedExecutor;

#[async_trait::async_trait]
impl QueryExecutor for CannedExecutor {
    async fn execute(&self, _sql: &str) -> Result<ExecutionResult, QueryError> {
        let mut row = Map::new();
        row.insert("test".to_owned(), Value::from(1));
        Ok(ExecutionResult { rows: vec![row], row_count: 1, execution_time_ms: 0.42 })
    }
}

/// Always fails with the given error.
struct FailingExecutor(QueryError);

#[async_trait::async_trait]
impl QueryExecutor for FailingExecutor {
    async fn execute(&self, _sql: &str) -> Result<ExecutionResult, QueryError> {
        Err(self.0.clone())
    }
}

/// Records how many executions overlap.
#[derive(Default)]
struct SlowExecutor {
    concurrent: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl QueryExecutor for SlowExecutor {
    async fn execute(&self, _sql: &str) -> Result<ExecutionResult, QueryError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionResult { rows: Vec::new(), row_count: 0, execution_time_ms: 100.0 })
    }
}

/// Hangs far past every deadline; records whether its future was dropped
/// before completing.
#[derive(Default)]
struct HangingExecutor {
    cancelled: AtomicBool,
}

#[async_trait::async_trait]
impl QueryExecutor for HangingExecutor {
    async fn execute(&self, _sql: &str) -> Result<ExecutionResult, QueryError> {
        struct DropFlag<'a>(&'a AtomicBool);
        impl Drop for DropFlag<'_> {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let flag = DropFlag(&self.cancelled);
        tokio::time::sleep(Duration::from_secs(30)).await;
        std::mem::forget(flag);
        Err(QueryError::internal("the statement was never cancelled"))
    }
}

async fn serve(executor: Arc<dyn QueryExecutor>) -> (Gateway, SocketAddr) {
    let config = GatewayConfig { host: Some("127.0.0.1".to_owned()), port: 0 };
    let gateway = Gateway::new(config, executor);
    let addr = gateway.start().await.unwrap();
    (gateway, addr)
}

async fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let head = format!(
        "{method} {path} HTTP/1.1\r\n\
         host: localhost\r\n\
         content-type: application/json\r\n\
         content-length: {}\r\n\
         connection: close\r\n\r\n\
         {body}",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|status| status.parse().ok())
        .unwrap_or_else(|| panic!("malformed response: {text:?}"));
    let body_start = text.find("\r\n\r\n").expect("missing header separator") + 4;
    let payload = serde_json::from_str(&text[body_start..]).expect("response body is not JSON");
    (status, payload)
}

async fn post_query(addr: SocketAddr, body: &str) -> (u16, Value) {
    request(addr, "POST", "/v1/query", body).await
}

#[tokio::test]
async fn select_returns_the_success_envelope() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let (status, payload) = post_query(addr, r#"{"sql":"SELECT 1 AS test"}"#).await;
    assert_eq!(status, 200);
    assert_eq!(payload["success"], Value::Bool(true));
    assert_eq!(payload["rows"][0]["test"], Value::from(1));
    assert_eq!(payload["rowCount"], Value::from(1));
    assert!(payload["executionTime"].is_number());
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn missing_or_empty_sql_is_a_missing_field_error() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    for body in ["{}", r#"{"sql":""}"#, r#"{"sql":"   "}"#] {
        let (status, payload) = post_query(addr, body).await;
        assert_eq!(status, 400, "{body}");
        assert_eq!(payload["success"], Value::Bool(false));
        assert_eq!(payload["error"]["code"], "MISSING_REQUIRED_FIELD");
    }
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_json_is_invalid_sql() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let (status, payload) = post_query(addr, "this is not json").await;
    assert_eq!(status, 400);
    assert_eq!(payload["error"]["code"], "INVALID_SQL");
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn other_methods_name_the_accepted_one() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let (status, payload) = request(addr, "GET", "/v1/query", "").await;
    assert_eq!(status, 400);
    assert_eq!(payload["error"]["code"], "INVALID_SQL");
    assert!(payload["error"]["message"].as_str().unwrap().contains("POST"));
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_paths_are_reported() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let (status, payload) = post_query_at(addr, "/v2/query").await;
    assert_eq!(status, 400);
    assert_eq!(payload["error"]["code"], "INVALID_SQL");
    gateway.stop().await.unwrap();
}

async fn post_query_at(addr: SocketAddr, path: &str) -> (u16, Value) {
    request(addr, "POST", path, r#"{"sql":"SELECT 1"}"#).await
}

#[tokio::test]
async fn oversized_statements_are_rejected_before_execution() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let sql = format!("SELECT '{}'", "x".repeat(11_000));
    let body = serde_json::to_string(&serde_json::json!({ "sql": sql })).unwrap();
    let (status, payload) = post_query(addr, &body).await;
    assert_eq!(status, 413);
    assert_eq!(payload["error"]["code"], "QUERY_TOO_LARGE");
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn unguarded_mutations_are_rejected() {
    let (gateway, addr) = serve(Arc::new(CannedExecutor)).await;
    let (status, payload) = post_query(addr, r#"{"sql":"UPDATE users SET name='x'"}"#).await;
    assert_eq!(status, 400);
    assert_eq!(payload["error"]["code"], "UNSAFE_QUERY");
    assert!(payload["error"]["message"].as_str().unwrap().contains("WHERE"));
    assert!(payload["error"]["detail"].as_str().unwrap().contains("WHERE 1=1"));
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn executor_errors_map_to_their_taxonomy_status() {
    let cases = [
        (QueryError::timeout(), 408, "QUERY_TIMEOUT"),
        (
            QueryError::new(ErrorKind::DatabaseUnavailable, "Database is unavailable"),
            503,
            "DATABASE_UNAVAILABLE",
        ),
        (QueryError::internal("boom"), 500, "INTERNAL_ERROR"),
    ];
    for (error, expected_status, expected_code) in cases {
        let (gateway, addr) = serve(Arc::new(FailingExecutor(error))).await;
        let (status, payload) = post_query(addr, r#"{"sql":"SELECT 1"}"#).await;
        assert_eq!(status, expected_status);
        assert_eq!(payload["error"]["code"], expected_code);
        gateway.stop().await.unwrap();
    }
}

#[tokio::test]
async fn the_accept_cap_bounds_concurrent_sockets() {
    let executor = Arc::new(SlowExecutor::default());
    let (gateway, addr) = serve(executor.clone()).await;

    let mut requests = Vec::new();
    for _ in 0..6 {
        requests.push(tokio::spawn(async move {
            post_query(addr, r#"{"sql":"SELECT 1"}"#).await
        }));
    }
    for handle in requests {
        let (status, _) = handle.await.unwrap();
        assert_eq!(status, 200);
    }
    assert!(
        executor.peak.load(Ordering::SeqCst) <= 2,
        "more than two sockets were serviced at once"
    );
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn client_disconnect_cancels_the_inflight_statement() {
    let executor = Arc::new(HangingExecutor::default());
    let (gateway, addr) = serve(executor.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = r#"{"sql":"SELECT pg_sleep(30)"}"#;
    let head = format!(
        "POST /v1/query HTTP/1.1\r\n\
         host: localhost\r\n\
         content-type: application/json\r\n\
         content-length: {}\r\n\r\n\
         {body}",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();

    // Let the statement get in flight, then walk away without reading the
    // response.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!executor.cancelled.load(Ordering::SeqCst));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        executor.cancelled.load(Ordering::SeqCst),
        "the statement kept running after the peer went away"
    );
    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn stop_clears_readiness_and_is_idempotent() {
    let (gateway, _addr) = serve(Arc::new(CannedExecutor)).await;
    assert!(gateway.is_ready());
    gateway.stop().await.unwrap();
    assert!(!gateway.is_ready());
    gateway.stop().await.unwrap();
}
