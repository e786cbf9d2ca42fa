//! Pool-backed connections to the embedded engine.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;

/// `postgres` is the superuser created by `initdb` and the default database
/// from which administrative work is done. Trust authentication on loopback
/// means no password is involved.
pub static USER_POSTGRES: &str = "postgres";
pub static DATABASE_POSTGRES: &str = "postgres";

const MAX_OPEN_CONNECTIONS: u32 = 5;
const CONNECTION_LIFETIME: Duration = Duration::from_secs(60 * 60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Per-statement timeout applied as a connection parameter, in milliseconds.
/// Defence in depth behind the request-level deadline.
const STATEMENT_TIMEOUT_MS: &str = "5000";

/// How to reach the engine.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub password: Option<String>,
}

impl ConnectionOptions {
    /// The fixed shape used by the supervisor: loopback, superuser, default
    /// database, no password.
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port,
            user: USER_POSTGRES.to_owned(),
            database: DATABASE_POSTGRES.to_owned(),
            password: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Open a pooled connection to the engine.
///
/// Construction is eager: the pool is opened and a liveness check runs
/// before this returns, so a `Ok` here means the engine answered a query.
pub async fn connect(options: &ConnectionOptions) -> Result<PgPool, ConnectionError> {
    let mut connect = PgConnectOptions::new()
        .host(&options.host)
        .port(options.port)
        .username(&options.user)
        .database(&options.database)
        .application_name("vibesql")
        .options([("statement_timeout", STATEMENT_TIMEOUT_MS)]);
    if let Some(password) = &options.password {
        connect = connect.password(password);
    }
    let pool = PgPoolOptions::new()
        .max_connections(MAX_OPEN_CONNECTIONS)
        .max_lifetime(CONNECTION_LIFETIME)
        .idle_timeout(IDLE_TIMEOUT)
        .connect_with(connect)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}
