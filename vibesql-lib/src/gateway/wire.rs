//! The fixed JSON envelope used on `/v1/query`.
//!
//! Success and failure shapes are mutually exclusive; absent fields are
//! omitted from the wire form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::{ExecutionResult, QueryError};

/// Request body: a JSON object with a single `sql` string.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub sql: Option<String>,
}

/// Wire form of a successful execution.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessEnvelope {
    pub success: bool,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub execution_time: f64,
}

/// Wire form of a failure.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FailureEnvelope {
    pub success: bool,
    pub error: WireError,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<ExecutionResult> for SuccessEnvelope {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: true,
            rows: result.rows,
            row_count: result.row_count,
            execution_time: result.execution_time_ms,
        }
    }
}

impl From<&QueryError> for FailureEnvelope {
    fn from(error: &QueryError) -> Self {
        Self {
            success: false,
            error: WireError {
                code: error.kind.code().to_owned(),
                message: error.message.clone(),
                detail: error.detail.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::query::{ExecutionResult, QueryError};

    use super::{FailureEnvelope, QueryRequest, SuccessEnvelope};

    #[test]
    fn success_envelope_round_trips() {
        let mut row = Map::new();
        row.insert("test".to_owned(), Value::from(1));
        let envelope = SuccessEnvelope::from(ExecutionResult {
            rows: vec![row],
            row_count: 1,
            execution_time_ms: 1.25,
        });
        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: SuccessEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn success_envelope_uses_camel_case_field_names() {
        let envelope = SuccessEnvelope::from(ExecutionResult {
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms: 0.5,
        });
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["success"], json!(true));
        assert_eq!(wire["rowCount"], json!(0));
        assert_eq!(wire["executionTime"], json!(0.5));
        assert!(wire.get("rows").is_some());
    }

    #[test]
    fn failure_envelope_round_trips() {
        let error = QueryError::invalid_sql("SQL syntax error").with_detail("at position 8");
        let envelope = FailureEnvelope::from(&error);
        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: FailureEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(envelope, decoded);
        assert_eq!(decoded.error.code, "INVALID_SQL");
    }

    #[test]
    fn absent_detail_is_omitted_from_the_wire() {
        let envelope = FailureEnvelope::from(&QueryError::missing_required_field());
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(!wire.contains("detail"));
    }

    #[test]
    fn request_decodes_with_and_without_sql() {
        let with: QueryRequest = serde_json::from_str(r#"{"sql":"SELECT 1"}"#).unwrap();
        assert_eq!(with.sql.as_deref(), Some("SELECT 1"));
        let without: QueryRequest = serde_json::from_str("{}").unwrap();
        assert!(without.sql.is_none());
    }
}
