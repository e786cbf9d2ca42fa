use std::fmt;

use sqlx::postgres::{PgDatabaseError, PgErrorPosition};
use thiserror::Error;

/// Canonical error kinds for the query surface.
///
/// Every failure on `/v1/query` is classified as exactly one of these ten
/// kinds; clients dispatch purely on the wire code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    InvalidSql,
    MissingRequiredField,
    UnsafeQuery,
    QueryTimeout,
    QueryTooLarge,
    ResultTooLarge,
    DocumentTooLarge,
    Internal,
    ServiceUnavailable,
    DatabaseUnavailable,
}

impl ErrorKind {
    /// All ten kinds, in wire-code order.
    pub const ALL: [Self; 10] = [
        Self::InvalidSql,
        Self::MissingRequiredField,
        Self::UnsafeQuery,
        Self::QueryTimeout,
        Self::QueryTooLarge,
        Self::ResultTooLarge,
        Self::DocumentTooLarge,
        Self::Internal,
        Self::ServiceUnavailable,
        Self::DatabaseUnavailable,
    ];

    /// The stable wire code for this kind.
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidSql => "INVALID_SQL",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::UnsafeQuery => "UNSAFE_QUERY",
            Self::QueryTimeout => "QUERY_TIMEOUT",
            Self::QueryTooLarge => "QUERY_TOO_LARGE",
            Self::ResultTooLarge => "RESULT_TOO_LARGE",
            Self::DocumentTooLarge => "DOCUMENT_TOO_LARGE",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::DatabaseUnavailable => "DATABASE_UNAVAILABLE",
        }
    }

    /// The fixed HTTP status for this kind.
    pub const fn status(self) -> u16 {
        match self {
            Self::InvalidSql | Self::MissingRequiredField | Self::UnsafeQuery => 400,
            Self::QueryTimeout => 408,
            Self::QueryTooLarge | Self::ResultTooLarge | Self::DocumentTooLarge => 413,
            Self::Internal => 500,
            Self::ServiceUnavailable | Self::DatabaseUnavailable => 503,
        }
    }

    /// A concise human message for kinds raised from engine errors.
    const fn message(self) -> &'static str {
        match self {
            Self::InvalidSql => "SQL syntax error",
            Self::MissingRequiredField => "The \"sql\" field is required",
            Self::UnsafeQuery => "Unsafe query rejected",
            Self::QueryTimeout => "Query execution timed out",
            Self::QueryTooLarge => "Query exceeds the maximum size",
            Self::ResultTooLarge => "Result exceeds the maximum number of rows",
            Self::DocumentTooLarge => "Document exceeds engine size limits",
            Self::Internal => "Internal error",
            Self::ServiceUnavailable => "Service is unavailable",
            Self::DatabaseUnavailable => "Database is unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure on the query surface.
///
/// Carries the [`ErrorKind`], a short human message, and — when the engine
/// supplied one — a detail string assembled from its message, detail, hint,
/// and position.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), detail: None }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn invalid_sql(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSql, message)
    }

    pub fn missing_required_field() -> Self {
        Self::new(
            ErrorKind::MissingRequiredField,
            "The \"sql\" field is required and must not be empty",
        )
    }

    pub fn unsafe_query() -> Self {
        Self::new(
            ErrorKind::UnsafeQuery,
            "UPDATE and DELETE statements must include a WHERE clause",
        )
        .with_detail("Add a WHERE clause to limit affected rows; use WHERE 1=1 to affect all rows")
    }

    /// The statement hit the request-level deadline.
    pub fn timeout() -> Self {
        Self::new(ErrorKind::QueryTimeout, ErrorKind::QueryTimeout.message())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, ErrorKind::Internal.message()).with_detail(detail)
    }

    /// Translate a driver error into the taxonomy.
    ///
    /// Engine errors carry a five-character SQLSTATE which is mapped through
    /// [`kind_for_sqlstate`]; driver-level I/O and pool failures mean the
    /// engine cannot be reached.
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db) => match db.try_downcast_ref::<PgDatabaseError>() {
                Some(pg) => {
                    let kind = kind_for_sqlstate(pg.code());
                    let mut detail = pg.message().to_owned();
                    if let Some(more) = pg.detail() {
                        detail.push_str("; detail: ");
                        detail.push_str(more);
                    }
                    if let Some(hint) = pg.hint() {
                        detail.push_str("; hint: ");
                        detail.push_str(hint);
                    }
                    match pg.position() {
                        Some(PgErrorPosition::Original(position)) => {
                            detail.push_str(&format!("; position: {position}"));
                        }
                        Some(PgErrorPosition::Internal { position, query }) => {
                            detail.push_str(&format!(
                                "; internal position: {position} in {query}"
                            ));
                        }
                        None => {}
                    }
                    Self::new(kind, kind.message()).with_detail(detail)
                }
                None => Self::internal(db.message().to_owned()),
            },
            error @ (sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed) => Self::new(
                ErrorKind::DatabaseUnavailable,
                ErrorKind::DatabaseUnavailable.message(),
            )
            .with_detail(error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// The partial SQLSTATE → kind map; unmatched codes are internal errors.
fn kind_for_sqlstate(code: &str) -> ErrorKind {
    match code {
        "42601" | "42703" | "42P01" | "42P02" | "42883" | "42804" => ErrorKind::InvalidSql,
        "57014" => ErrorKind::QueryTimeout,
        "53000" | "53100" | "53200" | "53300" | "53400" | "08000" | "08001" | "08003" | "08004"
        | "08006" => ErrorKind::DatabaseUnavailable,
        "54000" | "54001" => ErrorKind::DocumentTooLarge,
        _ => ErrorKind::Internal,
    }
}
