use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::assets::AssetError;
use crate::connection::ConnectionError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error("input/output error: {0}")]
    Io(#[from] io::Error),
    #[error("could not assemble the engine environment: {0}")]
    Environment(#[from] std::env::JoinPathsError),
    #[error("initdb failed with {status}: {stderr}")]
    InitDb { status: ExitStatus, stderr: String },
    #[error("could not materialise shadow directory: {0}")]
    Shadow(String),
    #[error("engine exited unexpectedly ({0})")]
    UnexpectedExit(String),
    #[error("engine did not become ready within {0:?}")]
    ReadinessTimeout(Duration),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
