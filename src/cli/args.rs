//! CLI argument definitions using clap

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "slp-wallet",
    version,
    about = "SLP wallet backend - UTXO reconciliation and transaction lifecycle",
    long_about = None
)]
pub struct Cli {
    /// Network to use: mainnet, testnet, regtest (overrides config)
    #[arg(short, long, global = true)]
    pub network: Option<String>,

    /// REST API base URL (overrides config)
    #[arg(long, global = true)]
    pub rest_url: Option<String>,

    /// Token validation endpoint (overrides config)
    #[arg(long, global = true)]
    pub validator_url: Option<String>,

    /// Custom data directory
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize or manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Reconcile addresses and show their balances
    Balance {
        /// Address to reconcile (repeatable)
        #[arg(short, long = "address", required = true)]
        addresses: Vec<String>,
    },

    /// Show transfers received by an address
    History {
        #[arg(short, long)]
        address: String,
    },

    /// List stored wallet transactions
    Txs {
        /// Only transactions with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Only transactions sent from this address
        #[arg(short, long)]
        from: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a configuration file with network defaults
    Init {
        /// Network: mainnet, testnet, regtest (default: mainnet)
        #[arg(short, long)]
        network: Option<String>,
    },
}
