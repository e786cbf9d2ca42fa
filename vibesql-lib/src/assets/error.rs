use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error(
        "unsupported platform {os}/{arch}; supported platforms: \
         linux/amd64, linux/arm64, darwin/amd64, darwin/arm64, windows/amd64"
    )]
    UnsupportedPlatform { os: String, arch: String },
    #[error("embedded asset {0:?} is not bundled in this build")]
    MissingAsset(String),
    #[error("input/output error: {0}")]
    Io(#[from] io::Error),
}
