//! Wallet Kit - wallet manager, wallet and transfer lifecycle over a pluggable engine
//!
//! The binary drives the in-memory simulated engine; it never touches a real chain.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use walletkit::cli::commands;
use walletkit::config::Config;

/// Wallet Kit - wallet lifecycle and event propagation
#[derive(Parser)]
#[command(name = "walletkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "walletkit.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against the simulated engine
    Simulate {
        /// Number of blocks to produce after the transfers
        #[arg(long, default_value = "6")]
        blocks: u64,

        /// Paper key used to sign transfers
        #[arg(long, env = "WALLETKIT_PAPER_KEY", default_value = "simulated paper key")]
        paper_key: String,

        /// Skip confirmation prompts
        #[arg(long)]
        yes: bool,
    },

    /// List the configured networks
    Networks,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config)?;

    // Execute command
    let result = match cli.command {
        Commands::Simulate {
            blocks,
            paper_key,
            yes,
        } => commands::simulate(&config, blocks, &paper_key, yes).await,
        Commands::Networks => commands::networks(&config),
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize tracing from `RUST_LOG`, falling back to the configured filter
fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
