//! `botkeeper` binary entry point.

use std::process::ExitCode;

use clap::Parser;

use botkeeper::bootstrap;
use botkeeper::cli::{Cli, Command, run_agent, run_doctor_command, run_reconcile_command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    bootstrap::init_tracing();
    bootstrap::install_panic_hook();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let outcome = run_agent().await?;
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Command::Reconcile { deactivate } => {
            run_reconcile_command(deactivate).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor { strict } => {
            run_doctor_command(strict).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
