#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command-line entry point for the huddle server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Main CLI structure for the huddle server
#[derive(Debug, Parser)]
#[command(name = "huddle-server")]
#[command(about = "Chat permission and unread propagation service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind, overriding configuration and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Configuration file (yaml, json or toml)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Serve from an in-process store seeded with demo data instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },
    /// Print the resolved configuration as YAML
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

async fn run_app(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve {
            port,
            config,
            in_memory,
        } => {
            let resolved = Config::load_config(config, port)?;
            server::server::run(resolved, in_memory).await
        }
        Commands::Config { config } => {
            let resolved = Config::load_config(config, None)?;
            let yaml = serde_yml::to_string(&resolved).context("failed to render configuration")?;
            print!("{yaml}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    run_app(Cli::parse()).await
}
