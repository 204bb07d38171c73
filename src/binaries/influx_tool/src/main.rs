#[macro_use]
extern crate anyhow;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod compact;
mod deletetsm;
mod hashdist;
mod transfer;

#[derive(Debug, Parser)]
#[clap(name = "influx-tool", about = "Tools for managing influx cluster", version)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Transfer persist data on disk from one node to multiple nodes
    Transfer(transfer::Config),
    /// Compact all shards fully
    Compact(compact::Config),
    /// Delete a measurement from raw tsm files
    Deletetsm(deletetsm::Config),
    /// Hash distribution calculation
    Hashdist(hashdist::Config),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Transfer(config) => transfer::run(config).await,
        Command::Compact(config) => compact::run(config).await,
        Command::Deletetsm(config) => deletetsm::run(config).await,
        Command::Hashdist(config) => hashdist::run(config).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
