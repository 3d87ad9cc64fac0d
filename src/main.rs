//! SLP Wallet CLI
//!
//! Operator interface for reconciling addresses and inspecting stored transactions

use clap::Parser;
use slp_wallet_backend::cli::args::{Cli, Commands, ConfigAction};
use slp_wallet_backend::cli::commands;
use slp_wallet_backend::config::{ConfigOverrides, NetworkType};
use std::process;

fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let network = match cli.network.as_deref().map(str::parse::<NetworkType>) {
        Some(Ok(network)) => Some(network),
        Some(Err(e)) => {
            eprintln!("Error: {}. Use: mainnet, testnet, or regtest", e);
            process::exit(1);
        }
        None => None,
    };

    let overrides = ConfigOverrides {
        network,
        rest_url: cli.rest_url.clone(),
        validator_url: cli.validator_url.clone(),
        data_dir: cli.data_dir.clone(),
        ..ConfigOverrides::default()
    };

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { network } => commands::config::init(network).map_err(Into::into),
        },

        Commands::Balance { addresses } => match tokio::runtime::Runtime::new() {
            Ok(rt) => rt
                .block_on(commands::account::balance(addresses, overrides))
                .map_err(Into::into),
            Err(e) => Err(format!("Failed to create async runtime: {}", e).into()),
        },

        Commands::History { address } => match tokio::runtime::Runtime::new() {
            Ok(rt) => rt
                .block_on(commands::account::history(address, overrides))
                .map_err(Into::into),
            Err(e) => Err(format!("Failed to create async runtime: {}", e).into()),
        },

        Commands::Txs { status, from } => {
            commands::txs::list(status, from, overrides).map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
