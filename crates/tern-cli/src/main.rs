//! `tern` -- CLI binary for the tern agent runtime.
//!
//! Subcommands:
//! - `tern onboard` -- create the config file and workspace templates.
//! - `tern run` -- start the gateway: channels + agent loop + cron.
//! - `tern agent` -- talk to the agent directly (one-shot or REPL).
//! - `tern status` -- show resolved configuration.
//!
//! Exit codes: 0 success, 1 failure, 2 invalid usage (clap).

use clap::{Parser, Subcommand};

mod commands;
mod config;

/// tern agent CLI.
#[derive(Parser)]
#[command(name = "tern", about = "tern multi-channel agent runtime", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and workspace templates.
    Onboard {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Start the gateway (channels + agent loop + scheduler).
    Run,

    /// Send a message to the agent directly.
    Agent {
        /// Message to send; omit for an interactive session.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show resolved configuration and workspace status.
    Status,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("TERN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Onboard { force } => commands::onboard::run(force),
        Commands::Run => commands::run::run().await,
        Commands::Agent { message } => commands::agent::run(message).await,
        Commands::Status => commands::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
