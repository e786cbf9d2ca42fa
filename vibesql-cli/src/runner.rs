use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args as ClapArgs;
use miette::{IntoDiagnostic, Result, WrapErr};

use vibesql::gateway::{Gateway, GatewayConfig};
use vibesql::query::execute::Executor;
use vibesql::supervisor::{Supervisor, DEFAULT_DATA_DIR, DEFAULT_ENGINE_PORT};

use crate::ExitResult;

#[derive(ClapArgs, Debug)]
pub(crate) struct Args {
    /// The directory holding the engine's persistent state.
    #[clap(
        long = "data-dir",
        env = "VIBESQL_DATA_DIR",
        value_name = "DIR",
        default_value = DEFAULT_DATA_DIR,
        display_order = 1
    )]
    pub(crate) data_dir: PathBuf,

    /// TCP port for the embedded engine itself; the HTTP port is fixed.
    #[clap(
        long = "engine-port",
        env = "VIBESQL_ENGINE_PORT",
        value_name = "PORT",
        default_value_t = DEFAULT_ENGINE_PORT,
        display_order = 2
    )]
    pub(crate) engine_port: u16,
}

pub(crate) fn invoke(args: Args) -> ExitResult {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(serve(args))?;
    Ok(ExitCode::SUCCESS)
}

/// Compose the application: supervisor → connection → executor → gateway,
/// then block until a shutdown signal. Teardown drains the gateway first so
/// in-flight requests finish before the engine goes away.
async fn serve(args: Args) -> Result<()> {
    let supervisor = Supervisor::new(&args.data_dir, args.engine_port);
    supervisor
        .start()
        .await
        .into_diagnostic()
        .wrap_err("Could not start the embedded engine")?;

    let outcome = run_gateway(&supervisor).await;

    // The engine is stopped even when the gateway failed.
    let stopped = supervisor
        .stop()
        .await
        .into_diagnostic()
        .wrap_err("Could not stop the embedded engine");
    outcome.and(stopped)
}

async fn run_gateway(supervisor: &Supervisor) -> Result<()> {
    let pool = supervisor
        .create_pool()
        .await
        .into_diagnostic()
        .wrap_err("Could not connect to the embedded engine")?;
    let gateway = Gateway::new(GatewayConfig::default(), Arc::new(Executor::new(pool)));
    gateway
        .start()
        .await
        .into_diagnostic()
        .wrap_err("Could not start the query gateway")?;
    gateway.wait_for_shutdown().await.into_diagnostic()
}
