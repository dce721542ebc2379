use clap::{ArgAction, Parser};
use sieve_cli::commands::optimize::OptimizeArgs;
use sieve_cli::commands::{Command, normalize_args};
use sieve_cli::report::FAILURE_CODE;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Sieve
///
/// Removes provably unreachable INVALID opcodes from EVM bytecode. Writes
/// `<outputName>.optimized.hex` and `<outputName>.report.json` into `<outputPath>`.
#[derive(Parser)]
#[command(name = "sieve", version, disable_version_flag = true)]
#[command(about = "Sieve: dead-assertion elimination for EVM bytecode")]
struct Cli {
    /// Print version.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    #[command(flatten)]
    args: OptimizeArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args()));

    let level = if cli.args.process_detail { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time()
        .init();

    match cli.args.execute().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "sieve failed");
            eprintln!("{err}");
            ExitCode::from(FAILURE_CODE)
        }
    }
}
