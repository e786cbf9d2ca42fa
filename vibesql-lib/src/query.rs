//! The restricted query surface: validation, execution, and the error
//! taxonomy shared by both.

pub mod execute;
pub mod validate;

mod error;

pub use error::{ErrorKind, QueryError};

use serde_json::{Map, Value};

/// Outcome of a successfully executed statement.
///
/// Rows are an ordered sequence of column-name → value mappings, exactly as
/// the engine returned them. `row_count` always equals `rows.len()`;
/// `execution_time_ms` is wall-clock time with microsecond resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub execution_time_ms: f64,
}

/// Runs one validated statement against the engine.
///
/// The gateway is written against this trait so that tests can substitute
/// the engine-backed [`execute::Executor`] with a stub.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult, QueryError>;
}
