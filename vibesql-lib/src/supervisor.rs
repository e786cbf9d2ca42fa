//! Supervise the embedded PostgreSQL engine: extract assets, initialise the
//! data directory on first run, launch and monitor the server process, and
//! guarantee orderly teardown.

mod config;
mod error;

pub use error::SupervisorError;

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::assets::{self, ExtractedEngine};
use crate::connection::{self, ConnectionOptions};

/// If set, names a pre-installed `postgres` binary to use instead of the
/// bundled distribution; extraction is skipped entirely. `initdb` and
/// `pg_ctl` are expected next to it.
pub static ENGINE_BIN_ENV: &str = "VIBESQL_POSTGRES_BIN";

/// With [`ENGINE_BIN_ENV`], names the engine's runtime-data root.
pub static SHARE_DIR_ENV: &str = "VIBESQL_SHARE_DIR";

/// Default data directory, relative to the launch directory.
pub static DEFAULT_DATA_DIR: &str = "vibe-data";

/// Default TCP port for the embedded engine. Deliberately off 5432 so a
/// system-wide PostgreSQL does not collide.
pub const DEFAULT_ENGINE_PORT: u16 = 5433;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_WAIT: Duration = Duration::from_secs(10);

/// The environment variable the dynamic linker consults on this platform.
const LIBRARY_PATH_ENV: &str = if cfg!(windows) {
    "PATH"
} else if cfg!(target_os = "macos") {
    "DYLD_LIBRARY_PATH"
} else {
    "LD_LIBRARY_PATH"
};

/// Resolved locations of the engine binaries and runtime data.
#[derive(Clone, Debug)]
struct Engine {
    bin_dir: PathBuf,
    server: PathBuf,
    initdb: PathBuf,
    ctl: Option<PathBuf>,
    lib_dir: Option<PathBuf>,
    share_dir: Option<PathBuf>,
}

impl From<ExtractedEngine> for Engine {
    fn from(extracted: ExtractedEngine) -> Self {
        Self {
            bin_dir: extracted.bin_dir,
            server: extracted.server,
            initdb: extracted.initdb,
            ctl: extracted.ctl,
            lib_dir: Some(extracted.lib_dir),
            share_dir: Some(extracted.share_dir),
        }
    }
}

/// Ephemeral on-disk state owned by one supervised run: the scratch
/// directory holding extracted assets, and any shadow directories.
struct Workspace {
    scratch: Option<TempDir>,
    shadows: Vec<PathBuf>,
}

impl Workspace {
    fn none() -> Self {
        Self { scratch: None, shadows: Vec::new() }
    }

    /// Remove everything, continuing past failures; the first error wins.
    fn remove(&mut self) -> Option<SupervisorError> {
        let mut first = None;
        for shadow in self.shadows.drain(..) {
            if let Err(error) = fs::remove_dir_all(&shadow) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not remove {}: {error}", shadow.display());
                    first.get_or_insert(SupervisorError::Io(error));
                }
            }
        }
        if let Some(scratch) = self.scratch.take() {
            if let Err(error) = scratch.close() {
                log::warn!("could not remove scratch directory: {error}");
                first.get_or_insert(SupervisorError::Io(error));
            }
        }
        first
    }
}

/// One supervised engine process and its plumbing.
struct Running {
    engine: Engine,
    workspace: Workspace,
    cancel: CancellationToken,
    pid: Option<u32>,
    kill: mpsc::Sender<()>,
    exited: watch::Receiver<bool>,
    fault: mpsc::Receiver<SupervisorError>,
    monitor: tokio::task::JoinHandle<()>,
}

/// Owns the embedded engine's lifecycle.
///
/// `start` extracts the bundled distribution, initialises the data
/// directory if this is the first run, launches the server, and returns
/// once a real pooled connection has succeeded. `stop` is idempotent and
/// always clears the scratch state, even on partial failure. `start` is not
/// re-entrant while the engine is running.
pub struct Supervisor {
    data_dir: PathBuf,
    port: u16,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl Supervisor {
    /// Supervise an engine with persistent state under `data_dir`.
    pub fn new<P: AsRef<Path>>(data_dir: P, port: u16) -> Self {
        let data_dir = data_dir.as_ref();
        let data_dir = env::current_dir()
            .map_or_else(|_| data_dir.to_path_buf(), |cwd| cwd.join(data_dir));
        Self {
            data_dir,
            port,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Extract, initialise, launch, and wait for readiness.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let (engine, mut workspace) = resolve_engine()?;
        if let Err(error) = self.prepare(&engine, &mut workspace).await {
            workspace.remove();
            return Err(error);
        }
        let running = match self.launch(engine, workspace) {
            Ok(running) => running,
            Err((error, mut workspace)) => {
                workspace.remove();
                return Err(error);
            }
        };
        self.running.store(true, Ordering::SeqCst);
        *state = Some(running);

        if let Err(error) = self.wait_until_ready(state.as_mut()).await {
            log::error!("engine failed to become ready: {error}");
            let _ = self.shutdown_locked(&mut state).await;
            return Err(error);
        }
        log::info!("embedded engine ready on port {}", self.port);
        Ok(())
    }

    /// Stop the engine and clear all scratch state. Idempotent.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        self.shutdown_locked(&mut state).await
    }

    /// Open a pooled connection to the supervised engine.
    pub async fn create_pool(&self) -> Result<PgPool, SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        Ok(connection::connect(&ConnectionOptions::local(self.port)).await?)
    }

    /// Prepare on-disk state: shadow directories where the platform needs
    /// them, then the data directory itself.
    async fn prepare(
        &self,
        engine: &Engine,
        workspace: &mut Workspace,
    ) -> Result<(), SupervisorError> {
        workspace.shadows = materialise_shadows(engine)?;
        self.initialise_data_dir(engine).await
    }

    /// Run `initdb` unless the data directory already carries the engine's
    /// version marker, then write the server configuration.
    async fn initialise_data_dir(&self, engine: &Engine) -> Result<(), SupervisorError> {
        if self.version_marker().is_file() {
            log::debug!("data directory {} already initialised", self.data_dir.display());
            return Ok(());
        }

        create_private_dir(&self.data_dir)?;

        let mut command = Command::new(&engine.initdb);
        command
            .arg("--no-locale")
            .arg("--encoding=UTF8")
            .arg("--auth=trust")
            .arg("--username")
            .arg(connection::USER_POSTGRES)
            .arg("--nosync")
            .arg("-D")
            .arg(&self.data_dir)
            .env("TZ", "UTC")
            .envs(engine_environment(engine)?)
            .stdin(Stdio::null());
        if let Some(share) = &engine.share_dir {
            command.arg("-L").arg(share);
        }
        log::info!("initialising data directory {}", self.data_dir.display());
        let output = command.output().await?;
        if !output.status.success() {
            // macOS builds of the bundled initdb can exit non-zero on
            // extension load failures while still producing a usable data
            // directory; the version marker decides.
            if cfg!(target_os = "macos") && self.version_marker().is_file() {
                log::warn!(
                    "initdb exited with {} but the version marker is present; continuing",
                    output.status
                );
            } else {
                return Err(SupervisorError::InitDb {
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }

        fs::write(self.data_dir.join("postgresql.conf"), config::postgresql_conf(self.port))?;
        fs::write(self.data_dir.join("pg_hba.conf"), config::pg_hba_conf())?;
        Ok(())
    }

    /// Spawn the server process and its monitoring plumbing.
    ///
    /// Command-line settings repeat the configuration file, belt and
    /// braces.
    fn launch(
        &self,
        engine: Engine,
        workspace: Workspace,
    ) -> Result<Running, (SupervisorError, Workspace)> {
        let environment = match engine_environment(&engine) {
            Ok(environment) => environment,
            Err(error) => return Err((error, workspace)),
        };
        let mut command = Command::new(&engine.server);
        command
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-h")
            .arg("127.0.0.1")
            .arg("-c")
            .arg(format!("max_connections={}", config::ENGINE_MAX_CONNECTIONS))
            .arg("-c")
            .arg(format!("shared_buffers={}", config::ENGINE_SHARED_BUFFERS))
            .env("TZ", "UTC")
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!("launching {}", engine.server.display());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => return Err((SupervisorError::Io(error), workspace)),
        };
        if let Some(stdout) = child.stdout.take() {
            forward_engine_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_engine_output(stderr);
        }

        let pid = child.id();
        let cancel = CancellationToken::new();
        let (fault_tx, fault_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let monitor = tokio::spawn(monitor_child(
            child,
            cancel.clone(),
            self.running.clone(),
            fault_tx,
            exit_tx,
            kill_rx,
        ));

        Ok(Running {
            engine,
            workspace,
            cancel,
            pid,
            kill: kill_tx,
            exited: exit_rx,
            fault: fault_rx,
            monitor,
        })
    }

    /// Poll until the engine is ready: pidfile present, child alive, no
    /// fault posted, and a real pooled connection succeeds.
    async fn wait_until_ready(
        &self,
        running: Option<&mut Running>,
    ) -> Result<(), SupervisorError> {
        let Some(running) = running else {
            return Err(SupervisorError::NotRunning);
        };
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        let mut tick = tokio::time::interval(READY_POLL_INTERVAL);
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(SupervisorError::ReadinessTimeout(READY_TIMEOUT));
            }
            tick.tick().await;
            // An unexpected exit during polling surfaces as its own error,
            // not as a readiness timeout.
            if let Ok(fault) = running.fault.try_recv() {
                return Err(fault);
            }
            if *running.exited.borrow() {
                return Err(SupervisorError::UnexpectedExit("during startup".to_owned()));
            }
            if !self.pidfile().is_file() {
                continue;
            }
            match connection::connect(&ConnectionOptions::local(self.port)).await {
                Ok(pool) => {
                    pool.close().await;
                    return Ok(());
                }
                Err(error) => log::debug!("engine not ready yet: {error}"),
            }
        }
    }

    async fn shutdown_locked(
        &self,
        state: &mut Option<Running>,
    ) -> Result<(), SupervisorError> {
        let Some(mut running) = state.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        };
        running.cancel.cancel();

        if !*running.exited.borrow() {
            let orderly = self.orderly_stop(&running).await;
            if !orderly {
                interrupt(&running);
            }
            let timely = tokio::time::timeout(
                STOP_WAIT,
                running.exited.wait_for(|exited| *exited),
            )
            .await
            .is_ok();
            if !timely {
                log::warn!("engine did not exit within {STOP_WAIT:?}; killing it");
                let _ = running.kill.try_send(());
                let _ = running.exited.wait_for(|exited| *exited).await;
            }
        }
        let _ = running.monitor.await;

        let cleanup_error = running.workspace.remove();
        self.running.store(false, Ordering::SeqCst);
        match cleanup_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Ask the control binary for a fast, waited stop. False when there is
    /// no control binary or it failed.
    async fn orderly_stop(&self, running: &Running) -> bool {
        let Some(ctl) = &running.engine.ctl else {
            return false;
        };
        let environment = match engine_environment(&running.engine) {
            Ok(environment) => environment,
            Err(_) => return false,
        };
        let output = Command::new(ctl)
            .arg("stop")
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("fast")
            .arg("-w")
            .envs(environment)
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::warn!("orderly stop failed with {}", output.status);
                false
            }
            Err(error) => {
                log::warn!("could not run the control binary: {error}");
                false
            }
        }
    }

    fn pidfile(&self) -> PathBuf {
        self.data_dir.join("postmaster.pid")
    }

    fn version_marker(&self) -> PathBuf {
        self.data_dir.join("PG_VERSION")
    }
}

/// Decide where the engine comes from: a pre-installed binary named by
/// [`ENGINE_BIN_ENV`], or the bundled distribution extracted into a fresh
/// scratch directory.
fn resolve_engine() -> Result<(Engine, Workspace), SupervisorError> {
    if let Some(server) = env::var_os(ENGINE_BIN_ENV).filter(|value| !value.is_empty()) {
        let server = PathBuf::from(server);
        let bin_dir = server.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let initdb = bin_dir.join(executable_name("initdb"));
        let ctl = {
            let ctl = bin_dir.join(executable_name("pg_ctl"));
            ctl.is_file().then_some(ctl)
        };
        let share_dir =
            env::var_os(SHARE_DIR_ENV).filter(|value| !value.is_empty()).map(PathBuf::from);
        log::info!("using pre-installed engine {}", server.display());
        let engine = Engine { bin_dir, server, initdb, ctl, lib_dir: None, share_dir };
        return Ok((engine, Workspace::none()));
    }

    let scratch = tempfile::Builder::new().prefix("vibesql-engine-").tempdir()?;
    let extracted = assets::extract(scratch.path())?;
    Ok((extracted.into(), Workspace { scratch: Some(scratch), shadows: Vec::new() }))
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_owned()
    }
}

/// The environment block the engine binaries run under: runtime-data and
/// extension locations plus the platform's library path, so the server can
/// resolve its shared library from the scratch directory.
fn engine_environment(
    engine: &Engine,
) -> Result<Vec<(&'static str, OsString)>, SupervisorError> {
    let mut environment = Vec::new();
    if let Some(share) = &engine.share_dir {
        environment.push(("PGSHAREDIR", share.clone().into_os_string()));
    }
    if let Some(lib) = &engine.lib_dir {
        environment.push(("PKGLIBDIR", lib.clone().into_os_string()));
        let mut dirs = vec![lib.clone()];
        if cfg!(target_os = "macos") {
            // Extensions resolve symbols against the server binary itself.
            dirs.push(engine.bin_dir.clone());
        }
        let joined = crate::util::prepend_to_path(&dirs, env::var_os(LIBRARY_PATH_ENV))?;
        environment.push((LIBRARY_PATH_ENV, joined));
    }
    Ok(environment)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match fs::DirBuilder::new().recursive(true).mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Forward engine log lines that matter to our own stderr stream.
fn forward_engine_output<R>(stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("ERROR") || line.contains("FATAL") {
                log::error!(target: "engine", "{line}");
            }
        }
    });
}

/// Block on the child's exit. An exit while the cancellation token is not
/// signalled is an unexpected death: the running flag is cleared and an
/// error is posted on the single-slot fault channel. An exit after
/// cancellation is expected and ignored. Kill requests arriving on the kill
/// channel are applied while waiting.
async fn monitor_child(
    mut child: Child,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    fault: mpsc::Sender<SupervisorError>,
    exited: watch::Sender<bool>,
    mut kill: mpsc::Receiver<()>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill.recv() => {
                if let Err(error) = child.start_kill() {
                    log::warn!("could not kill the engine: {error}");
                }
            }
        }
    };
    let _ = exited.send(true);
    let described = match status {
        Ok(status) => status.to_string(),
        Err(error) => format!("unwaitable: {error}"),
    };
    if cancel.is_cancelled() {
        log::debug!("engine exited ({described})");
    } else {
        running.store(false, Ordering::SeqCst);
        log::error!("engine exited unexpectedly ({described})");
        let _ = fault.try_send(SupervisorError::UnexpectedExit(described));
    }
}

/// Nudge the engine towards exit: interrupt on POSIX, kill elsewhere.
#[cfg(unix)]
fn interrupt(running: &Running) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match running.pid.and_then(|pid| i32::try_from(pid).ok()) {
        Some(pid) => {
            if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGINT) {
                log::warn!("could not interrupt the engine: {error}");
                let _ = running.kill.try_send(());
            }
        }
        None => {
            let _ = running.kill.try_send(());
        }
    }
}

#[cfg(not(unix))]
fn interrupt(running: &Running) {
    let _ = running.kill.try_send(());
}

/// Mirror the runtime-data tree and the extension libraries at the root of
/// the current drive.
///
/// The bundled Windows binaries resolve `/`-rooted paths and `$libdir`
/// against the current drive rather than relative to the binary, so the
/// engine only finds its runtime data through these copies. They are
/// tracked in the workspace and removed on stop.
#[cfg(windows)]
fn materialise_shadows(engine: &Engine) -> Result<Vec<PathBuf>, SupervisorError> {
    use std::path::{Component, Prefix};

    let (Some(share), Some(lib)) = (&engine.share_dir, &engine.lib_dir) else {
        // Pre-installed engines resolve their own paths.
        return Ok(Vec::new());
    };
    let cwd = env::current_dir()?;
    let drive = match cwd.components().next() {
        Some(Component::Prefix(prefix)) => match prefix.kind() {
            Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                format!(r"{}:\", letter as char)
            }
            _ => return Ok(Vec::new()),
        },
        _ => return Ok(Vec::new()),
    };

    let share_shadow = PathBuf::from(&drive).join("share");
    let lib_shadow = PathBuf::from(&drive).join("lib");

    fs::create_dir_all(&share_shadow)?;
    let options = fs_extra::dir::CopyOptions {
        overwrite: true,
        content_only: true,
        ..fs_extra::dir::CopyOptions::new()
    };
    fs_extra::dir::copy(share, &share_shadow, &options)
        .map_err(|error| SupervisorError::Shadow(error.to_string()))?;

    fs::create_dir_all(&lib_shadow)?;
    for entry in fs::read_dir(lib)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), lib_shadow.join(entry.file_name()))?;
        }
    }
    Ok(vec![share_shadow, lib_shadow])
}

#[cfg(not(windows))]
fn materialise_shadows(_engine: &Engine) -> Result<Vec<PathBuf>, SupervisorError> {
    Ok(Vec::new())
}
