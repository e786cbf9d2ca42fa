use clap::{Parser, Subcommand};

use crate::runner;

/// Run a local PostgreSQL with an HTTP/JSON query surface.
#[derive(Parser)]
#[clap(author, version, about = "Zero-configuration local PostgreSQL over HTTP", long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Option<Command>,

    // Default command, `serve`. Note that `runner::Args` appears here AND in
    // the `Serve` subcommand. This pattern (along with `next_help_heading`)
    // is a way to have a default subcommand with clap.
    // https://github.com/clap-rs/clap/issues/975#issuecomment-1426424232
    #[clap(flatten)]
    pub serve: runner::Args,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the embedded engine and the query gateway (DEFAULT).
    #[clap(display_order = 1)]
    Serve(runner::Args),
}
