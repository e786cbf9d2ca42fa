//! `vibesql` — zero-configuration local PostgreSQL over HTTP.

mod cli;
mod runner;

use std::process::ExitCode;

use clap::Parser;
use miette::{IntoDiagnostic, Result};

pub(crate) type ExitResult = Result<ExitCode>;

fn main() -> ExitResult {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .into_diagnostic()?;

    let cli = cli::Cli::parse();
    // `Serve` is the default command when none is specified.
    let command = cli.command.unwrap_or(cli::Command::Serve(cli.serve));
    match command {
        cli::Command::Serve(args) => runner::invoke(args),
    }
}
