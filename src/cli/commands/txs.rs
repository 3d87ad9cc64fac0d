//! Transaction listing

use crate::config::{data_dir, load_config, ConfigError, ConfigOverrides};
use crate::storage::{StorageError, TxStorage};
use crate::tx::controller::status_counts;
use crate::tx::{TxQuery, TxStateError, TxStateManager, TxStatus};

#[derive(Debug, thiserror::Error)]
pub enum TxsCommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(#[from] TxStateError),

    #[error("{0}")]
    InvalidStatus(String),
}

/// List stored transactions matching the filters
pub fn list(
    status: Option<String>,
    from: Option<String>,
    overrides: ConfigOverrides,
) -> Result<(), TxsCommandError> {
    let config = load_config(None, overrides)?;
    let storage = TxStorage::open(data_dir(&config)?)?;
    let state = TxStateManager::new(storage, &config.wallet, config.chain.network.network_id());

    let mut query = TxQuery::new();
    if let Some(status) = status {
        query = query.status(
            status
                .parse::<TxStatus>()
                .map_err(TxsCommandError::InvalidStatus)?,
        );
    }
    if let Some(from) = from {
        query = query.from(from);
    }

    let txs = state.get_filtered_tx_list(&query)?;
    if txs.is_empty() {
        println!("No transactions found");
        return Ok(());
    }

    for meta in &txs {
        println!(
            "{}  {:<10} {} -> {}  {} sats{}",
            meta.time.format("%Y-%m-%d %H:%M:%S"),
            meta.status(),
            meta.params.from,
            meta.params.to,
            meta.params.value_sats,
            meta.params
                .token
                .as_ref()
                .map(|t| format!(" + {} {}", t.amount, t.token_id))
                .unwrap_or_default()
        );
        if let Some(hash) = meta.hash() {
            println!("    hash:  {}", hash);
        }
        if let Some(err) = meta.err() {
            println!("    error: {}", err);
        }
    }

    println!();
    let summary: Vec<String> = status_counts(&txs)
        .into_iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    println!("{} transactions ({})", txs.len(), summary.join(", "));

    Ok(())
}
