//! Main entry point for the blitzseal CLI app

use blitzseal::cli::Args;
use blitzseal::cli_runner;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match cli_runner::run_cli_app(args.command) {
        Ok(summary) if summary.succeeded() => std::process::ExitCode::SUCCESS,
        Ok(summary) => {
            eprintln!(
                "{} completed, {} failed, {} cancelled",
                summary.completed, summary.failed, summary.cancelled
            );
            std::process::ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "blitzseal=debug" } else { "blitzseal=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
