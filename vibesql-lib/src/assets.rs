//! Per-platform embedded engine assets: selection and extraction.
//!
//! The embedded files live under `assets/<platform>/` in the source tree and
//! are produced by the packaging pipeline. Extraction materialises the set
//! for the current platform into a scratch directory so the engine can
//! resolve its runtime dependencies.

mod error;

pub use error::AssetError;

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "assets"]
struct Bundled;

/// The platforms an engine distribution is bundled for.
pub static SUPPORTED_PLATFORMS: [&str; 5] = [
    "linux/amd64",
    "linux/arm64",
    "darwin/amd64",
    "darwin/arm64",
    "windows/amd64",
];

/// The files that make up one platform's engine distribution.
#[derive(Debug)]
pub struct Manifest {
    /// Directory under `assets/` holding this platform's files.
    pub platform: &'static str,
    pub server: &'static str,
    pub initdb: &'static str,
    pub ctl: &'static str,
    /// The engine's runtime shared library.
    pub library: &'static str,
    /// Auxiliary libraries placed next to the binaries (Windows only).
    pub auxiliary: &'static [&'static str],
    /// Engine extension libraries copied into `lib/` (Windows only).
    pub extensions: &'static [&'static str],
    /// Gzip-compressed tar of the engine's read-only runtime data.
    pub share_archive: &'static str,
}

impl Manifest {
    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.platform, name)
    }
}

const LINUX_AMD64: Manifest = Manifest {
    platform: "linux-amd64",
    server: "postgres",
    initdb: "initdb",
    ctl: "pg_ctl",
    library: "libpq.so.5",
    auxiliary: &[],
    extensions: &[],
    share_archive: "share.tar.gz",
};

const LINUX_ARM64: Manifest = Manifest { platform: "linux-arm64", ..LINUX_AMD64 };

const DARWIN_AMD64: Manifest = Manifest {
    platform: "darwin-amd64",
    library: "libpq.5.dylib",
    ..LINUX_AMD64
};

const DARWIN_ARM64: Manifest = Manifest {
    platform: "darwin-arm64",
    library: "libpq.5.dylib",
    ..LINUX_AMD64
};

const WINDOWS_AMD64: Manifest = Manifest {
    platform: "windows-amd64",
    server: "postgres.exe",
    initdb: "initdb.exe",
    ctl: "pg_ctl.exe",
    library: "libpq.dll",
    auxiliary: &[
        "libiconv-2.dll",
        "libintl-9.dll",
        "libwinpthread-1.dll",
        "libxml2-2.dll",
        "libssl-3-x64.dll",
        "libcrypto-3-x64.dll",
        "zlib1.dll",
    ],
    extensions: &["plpgsql.dll", "dict_snowball.dll"],
    share_archive: "share.tar.gz",
};

/// Select the manifest for the given OS and architecture.
///
/// The names follow [`std::env::consts::OS`] and
/// [`std::env::consts::ARCH`]; `windows/arm64` is not supported.
pub fn manifest_for(os: &str, arch: &str) -> Result<&'static Manifest, AssetError> {
    match (os, arch) {
        ("linux", "x86_64") => Ok(&LINUX_AMD64),
        ("linux", "aarch64") => Ok(&LINUX_ARM64),
        ("macos", "x86_64") => Ok(&DARWIN_AMD64),
        ("macos", "aarch64") => Ok(&DARWIN_ARM64),
        ("windows", "x86_64") => Ok(&WINDOWS_AMD64),
        _ => Err(AssetError::UnsupportedPlatform { os: os.to_owned(), arch: arch.to_owned() }),
    }
}

/// Select the manifest for the current platform.
pub fn manifest() -> Result<&'static Manifest, AssetError> {
    manifest_for(std::env::consts::OS, std::env::consts::ARCH)
}

/// Locations of the engine files after extraction into a scratch root.
#[derive(Clone, Debug)]
pub struct ExtractedEngine {
    pub bin_dir: PathBuf,
    pub server: PathBuf,
    pub initdb: PathBuf,
    /// `None` when the control binary was not bundled; shutdown then falls
    /// back to signals.
    pub ctl: Option<PathBuf>,
    pub lib_dir: PathBuf,
    pub share_dir: PathBuf,
}

/// Materialise the current platform's engine distribution under `scratch`.
///
/// Binaries land in the scratch root with execute permission, the shared
/// library (plus any extension libraries) in `lib/`, auxiliary libraries in
/// the root, and the runtime-data archive is expanded into `share/`.
pub fn extract(scratch: &Path) -> Result<ExtractedEngine, AssetError> {
    let manifest = manifest()?;

    let server = write_executable(manifest, manifest.server, scratch)?;
    let initdb = write_executable(manifest, manifest.initdb, scratch)?;
    let ctl = match fetch(&manifest.key(manifest.ctl)) {
        Some(data) => {
            let path = scratch.join(manifest.ctl);
            fs::write(&path, &data)?;
            set_executable(&path)?;
            Some(path)
        }
        None => {
            log::warn!(
                "control binary {} is not bundled; shutdown will fall back to signals",
                manifest.ctl
            );
            None
        }
    };

    let lib_dir = scratch.join("lib");
    fs::create_dir_all(&lib_dir)?;
    fs::write(lib_dir.join(manifest.library), &require(&manifest.key(manifest.library))?)?;

    for name in manifest.auxiliary {
        match fetch(&manifest.key(name)) {
            Some(data) => fs::write(scratch.join(name), &data)?,
            None => log::warn!("auxiliary library {name} is not bundled"),
        }
    }
    for name in manifest.extensions {
        match fetch(&manifest.key(name)) {
            Some(data) => fs::write(lib_dir.join(name), &data)?,
            None => log::warn!("extension library {name} is not bundled"),
        }
    }

    let share_dir = scratch.join("share");
    let archive = require(&manifest.key(manifest.share_archive))?;
    unpack_archive(archive.as_ref(), &share_dir)?;

    Ok(ExtractedEngine {
        bin_dir: scratch.to_path_buf(),
        server,
        initdb,
        ctl,
        lib_dir,
        share_dir,
    })
}

fn fetch(key: &str) -> Option<Cow<'static, [u8]>> {
    Bundled::get(key).map(|file| file.data)
}

fn require(key: &str) -> Result<Cow<'static, [u8]>, AssetError> {
    fetch(key).ok_or_else(|| AssetError::MissingAsset(key.to_owned()))
}

fn write_executable(manifest: &Manifest, name: &str, dir: &Path) -> Result<PathBuf, AssetError> {
    let data = require(&manifest.key(name))?;
    let path = dir.join(name);
    fs::write(&path, &data)?;
    set_executable(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Expand a gzip-compressed tar into `destination`.
///
/// Regular files keep the permission bits recorded in the archive;
/// directories are created with permissive defaults.
fn unpack_archive<R: io::Read>(reader: R, destination: &Path) -> Result<(), AssetError> {
    fs::create_dir_all(destination)?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(destination)?;
    Ok(())
}
