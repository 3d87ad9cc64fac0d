//! Account command implementations

use std::sync::Arc;

use crate::account::{AccountReconciler, ReconcileError};
use crate::chain::{NetworkError, RestClient};
use crate::config::{data_dir, load_config, ConfigError, ConfigOverrides, GlobalConfig};
use crate::storage::file_system::RECONCILER_SNAPSHOT_FILE;

#[derive(Debug, thiserror::Error)]
pub enum AccountCommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),
}

fn open_reconciler(config: &GlobalConfig) -> Result<AccountReconciler, AccountCommandError> {
    let client = Arc::new(RestClient::new(
        &config.chain.rest_url,
        &config.chain.validator_url,
        config.chain.network,
        config.wallet.request_timeout(),
    )?);

    let snapshot = data_dir(config)?.join(RECONCILER_SNAPSHOT_FILE);
    let reconciler = AccountReconciler::new(client.clone(), client.clone(), &config.wallet)
        .with_history_indexer(client)
        .with_snapshot(snapshot)?;

    Ok(reconciler)
}

/// Reconcile each address and print its balances
pub async fn balance(
    addresses: Vec<String>,
    overrides: ConfigOverrides,
) -> Result<(), AccountCommandError> {
    let config = load_config(None, overrides)?;
    let reconciler = open_reconciler(&config)?;

    for address in &addresses {
        reconciler.track(address);
        let balances = reconciler.reconcile(address).await?;

        println!("{}", address);
        println!(
            "  Base currency: {} sats ({:.8})",
            balances.base_currency_available,
            balances.base_currency_available as f64 / 100_000_000.0
        );

        if balances.per_token.is_empty() {
            println!("  Tokens:        none");
        }
        for (token_id, amount) in &balances.per_token {
            match reconciler.token_metadata(token_id) {
                Some(meta) => println!("  {:<14} {} ({})", meta.ticker, amount, meta.name),
                None => println!("  {:<14} {}", &token_id[..token_id.len().min(12)], amount),
            }
        }

        let quarantined = reconciler
            .utxos(address)
            .iter()
            .filter(|u| u.quarantined)
            .count();
        if quarantined > 0 {
            println!();
            println!("⚠️  {} output(s) quarantined (malformed token data)", quarantined);
        }
    }

    Ok(())
}

/// Sync and print transfers received by `address`
pub async fn history(address: String, overrides: ConfigOverrides) -> Result<(), AccountCommandError> {
    let config = load_config(None, overrides)?;
    let reconciler = open_reconciler(&config)?;

    reconciler.track(&address);
    let fresh = reconciler.sync_history(&address).await?;
    let transfers = reconciler.incoming_transfers(&address);

    println!("Incoming transfers for {} ({} new):", address, fresh.len());
    if transfers.is_empty() {
        println!("  none");
    }
    for transfer in transfers {
        let height = transfer
            .block_height
            .map(|h| h.to_string())
            .unwrap_or_else(|| "mempool".to_string());
        print!("  {} [{}] {} sats", transfer.txid, height, transfer.amount_sats);
        if let Some(token) = transfer.token {
            print!(" + {} of {}", token.quantity, token.token_id);
        }
        println!();
    }

    Ok(())
}
