//! CTF Deployer - entry point
//!
//! Usage:
//!   ctf-deployer up [--env-file .env] [-s] [-p] [-u]
//!   ctf-deployer down [--env-file .env]
//!
//! `up` validates the environment, acquires the instance lock and runs the
//! deployer until interrupted. `down` tears down every container belonging
//! to this deployment and releases its ports.

mod down;
mod up;

use clap::{Parser, Subcommand};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ctf-deployer")]
#[command(version)]
#[command(about = "Per-user CTF challenge deployer")]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the environment and run the deployer
    Up(up::UpArgs),

    /// Remove every container of this deployment and release its ports
    Down(down::DownArgs),
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "info,ctf_deployer=info,deployer_server=info",
        1 => "info,ctf_deployer=debug,deployer_server=debug,container_runtime=debug",
        _ => "debug,ctf_deployer=trace,deployer_server=trace,container_runtime=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("CTF Deployer v{}", VERSION);

    let result = match cli.command {
        Commands::Up(args) => up::run(args).await,
        Commands::Down(args) => down::run(args).await,
    };

    if let Err(ref e) = result {
        // Structured failure line for the wrapping deploy tooling.
        eprintln!("{}", serde_json::json!({ "status": "error", "message": e.to_string() }));
    }
    result
}
