//! Account reconciliation
//!
//! Keeps the UTXO cache, token metadata and balances of every tracked address
//! in step with the chain. One pass per address:
//!
//! 1. fetch the address's UTXOs
//! 2. diff against the cache (drop spent outputs and unvalidated token outputs)
//! 3. classify unseen outputs from their transaction's output scripts
//! 4. validate all token candidates in one batch
//! 5. apply verdicts; a failed batch leaves every candidate unvalidated
//! 6. resolve token metadata and recompute balances
//! 7. publish and persist the new state
//!
//! Passes for one address are serialized; different addresses may reconcile
//! concurrently.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::balance::aggregate;
use super::observable::ObservableStore;
use super::utxo_cache::{classify, UtxoCache};
use super::validator::TokenValidator;
use crate::chain::{
    timed, ChainSource, ChainUtxo, HistoryIndexer, NetworkError, RawHistoricalTx,
    TokenValidationOracle,
};
use crate::config::WalletSettings;
use crate::script::{decode_genesis, decode_output_script};
use crate::storage::file_system::{load_json, save_json};
use crate::storage::StorageError;
use crate::types::{AccountBalances, TokenMetadata, Utxo};

/// Errors that can occur during reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No history indexer configured")]
    NoHistoryIndexer,
}

/// Cached genesis lookup result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenMetadataEntry {
    Known(TokenMetadata),
    /// Genesis failed to decode; outputs of the token are quarantined
    Malformed { reason: String },
}

/// Token leg of an incoming transfer, in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingToken {
    pub token_id: String,
    pub quantity: u64,
}

/// Transfer received from outside the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingTransfer {
    pub txid: String,
    pub block_height: Option<u32>,
    pub amount_sats: u64,
    pub token: Option<IncomingToken>,
}

/// Reconciled state of one address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub utxos: UtxoCache,
    pub balances: AccountBalances,
    pub last_reconciled: Option<DateTime<Utc>>,
    /// Highest block covered by history sync
    pub synced_block: u32,
    pub incoming: Vec<IncomingTransfer>,
}

/// Everything the reconciler owns, published as one snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerState {
    pub accounts: BTreeMap<String, AccountState>,
    pub token_metadata: BTreeMap<String, TokenMetadataEntry>,
}

impl ReconcilerState {
    /// Metadata of tokens whose genesis decoded
    pub fn known_metadata(&self) -> HashMap<String, TokenMetadata> {
        known_metadata(&self.token_metadata)
    }
}

fn known_metadata(entries: &BTreeMap<String, TokenMetadataEntry>) -> HashMap<String, TokenMetadata> {
    entries
        .iter()
        .filter_map(|(id, entry)| match entry {
            TokenMetadataEntry::Known(meta) => Some((id.clone(), meta.clone())),
            TokenMetadataEntry::Malformed { .. } => None,
        })
        .collect()
}

/// Reconciles tracked addresses against the chain
///
/// # Example
///
/// ```ignore
/// let reconciler = AccountReconciler::new(chain, oracle, &settings);
/// reconciler.track("bitcoincash:qq...");
/// let balances = reconciler.reconcile("bitcoincash:qq...").await?;
/// println!("{} sats spendable", balances.base_currency_available);
/// ```
pub struct AccountReconciler {
    chain: Arc<dyn ChainSource>,
    validator: TokenValidator,
    indexer: Option<Arc<dyn HistoryIndexer>>,
    timeout: Duration,
    store: ObservableStore<ReconcilerState>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    snapshot_path: Option<PathBuf>,
}

impl AccountReconciler {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        oracle: Arc<dyn TokenValidationOracle>,
        settings: &WalletSettings,
    ) -> Self {
        let timeout = settings.request_timeout();
        Self {
            chain,
            validator: TokenValidator::new(oracle, settings.validation_batch_size, timeout),
            indexer: None,
            timeout,
            store: ObservableStore::new(ReconcilerState::default()),
            locks: Mutex::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    pub fn with_history_indexer(mut self, indexer: Arc<dyn HistoryIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Persist state to `path` after every pass, restoring any existing snapshot
    pub fn with_snapshot(mut self, path: PathBuf) -> Result<Self, ReconcileError> {
        if let Some(state) = load_json::<ReconcilerState>(&path)? {
            log::info!(
                "Restored {} accounts from {}",
                state.accounts.len(),
                path.display()
            );
            self.store.set(state);
        }
        self.snapshot_path = Some(path);
        Ok(self)
    }

    /// Start tracking an address
    pub fn track(&self, address: &str) {
        self.store.update(|state| {
            state.accounts.entry(address.to_string()).or_default();
        });
    }

    pub fn is_tracked(&self, address: &str) -> bool {
        self.store.read(|s| s.accounts.contains_key(address))
    }

    pub fn tracked_addresses(&self) -> Vec<String> {
        self.store.read(|s| s.accounts.keys().cloned().collect())
    }

    /// Snapshot of the whole reconciled state
    pub fn state(&self) -> ReconcilerState {
        self.store.get()
    }

    /// Balance-update notifications
    pub fn subscribe(&self) -> watch::Receiver<ReconcilerState> {
        self.store.subscribe()
    }

    pub fn balances(&self, address: &str) -> Option<AccountBalances> {
        self.store
            .read(|s| s.accounts.get(address).map(|a| a.balances.clone()))
    }

    /// Balances of an address that completed at least one pass
    pub fn reconciled_balances(&self, address: &str) -> Option<AccountBalances> {
        self.store.read(|s| {
            s.accounts
                .get(address)
                .filter(|a| a.last_reconciled.is_some())
                .map(|a| a.balances.clone())
        })
    }

    pub fn utxos(&self, address: &str) -> Vec<Utxo> {
        self.store.read(|s| {
            s.accounts
                .get(address)
                .map(|a| a.utxos.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Outputs usable as base-currency inputs
    pub fn spendable_utxos(&self, address: &str) -> Vec<Utxo> {
        self.utxos(address)
            .into_iter()
            .filter(|u| u.spendable && !u.quarantined && !u.is_token())
            .collect()
    }

    /// Valid, non-baton outputs holding `token_id`
    pub fn token_utxos(&self, address: &str, token_id: &str) -> Vec<Utxo> {
        self.utxos(address)
            .into_iter()
            .filter(|u| {
                u.holds_valid_tokens()
                    && u.token_info
                        .as_ref()
                        .map(|t| t.token_id == token_id)
                        .unwrap_or(false)
            })
            .collect()
    }

    pub fn token_metadata(&self, token_id: &str) -> Option<TokenMetadata> {
        self.store.read(|s| match s.token_metadata.get(token_id) {
            Some(TokenMetadataEntry::Known(meta)) => Some(meta.clone()),
            _ => None,
        })
    }

    pub fn incoming_transfers(&self, address: &str) -> Vec<IncomingTransfer> {
        self.store.read(|s| {
            s.accounts
                .get(address)
                .map(|a| a.incoming.clone())
                .unwrap_or_default()
        })
    }

    fn address_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one reconciliation pass for `address`, tracking it if needed
    pub async fn reconcile(&self, address: &str) -> Result<AccountBalances, ReconcileError> {
        let lock = self.address_lock(address);
        let _guard = lock.lock().await;

        log::debug!("Reconciling {}", address);

        let fetched = timed(self.timeout, self.chain.fetch_utxos(address)).await?;

        let mut cache = self.store.read(|s| {
            s.accounts
                .get(address)
                .map(|a| a.utxos.clone())
                .unwrap_or_default()
        });

        let diff = cache.diff(&fetched);
        if !diff.spent.is_empty() || !diff.stale.is_empty() {
            log::debug!(
                "{}: {} spent, {} awaiting re-evaluation",
                address,
                diff.spent.len(),
                diff.stale.len()
            );
        }

        self.classify_unseen(address, &diff.unseen, &mut cache).await;

        let candidates = cache.validation_candidates();
        if !candidates.is_empty() {
            match self.validator.validate(&candidates).await {
                Ok(verdicts) => {
                    for (txid, valid) in verdicts {
                        cache.set_validity(&txid, valid);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Token validation failed for {} candidates, leaving them unvalidated: {}",
                        candidates.len(),
                        e
                    );
                }
            }
        }

        let new_metadata = self.resolve_metadata(&cache).await;

        let mut metadata = self.store.read(|s| s.token_metadata.clone());
        metadata.extend(new_metadata.clone());
        for (token_id, entry) in &metadata {
            if let TokenMetadataEntry::Malformed { .. } = entry {
                let count = cache.quarantine_token(token_id);
                if count > 0 {
                    log::warn!("Quarantined {} outputs of malformed token {}", count, token_id);
                }
            }
        }

        let balances = aggregate(cache.iter(), &known_metadata(&metadata));

        let utxo_count = cache.len();
        self.store.update(|state| {
            state.token_metadata.extend(new_metadata);
            let account = state.accounts.entry(address.to_string()).or_default();
            account.utxos = cache;
            account.balances = balances.clone();
            account.last_reconciled = Some(Utc::now());
        });

        self.persist()?;

        log::info!(
            "Reconciled {}: {} utxos, {} sats spendable, {} tokens",
            address,
            utxo_count,
            balances.base_currency_available,
            balances.per_token.len()
        );

        Ok(balances)
    }

    /// Reconcile every tracked address
    ///
    /// A failing address does not stop the others.
    pub async fn reconcile_all(&self) -> Vec<(String, Result<AccountBalances, ReconcileError>)> {
        let mut results = Vec::new();
        for address in self.tracked_addresses() {
            let result = self.reconcile(&address).await;
            if let Err(e) = &result {
                log::warn!("Reconciliation of {} failed: {}", address, e);
            }
            results.push((address, result));
        }
        results
    }

    /// Classify unseen outputs, one transaction fetch per txid
    ///
    /// Outputs whose transaction cannot be fetched stay out of the cache and
    /// are picked up again next pass.
    async fn classify_unseen(&self, address: &str, unseen: &[ChainUtxo], cache: &mut UtxoCache) {
        let mut by_txid: BTreeMap<&str, Vec<&ChainUtxo>> = BTreeMap::new();
        for utxo in unseen {
            by_txid.entry(utxo.outpoint.txid.as_str()).or_default().push(utxo);
        }

        for (txid, outputs) in by_txid {
            match timed(self.timeout, self.chain.fetch_transaction(txid)).await {
                Ok(scripts) => {
                    for fetched in outputs {
                        cache.insert(classify(address, fetched, &scripts));
                    }
                }
                Err(e) => {
                    log::warn!("Skipping {} outputs of {} this pass: {}", outputs.len(), txid, e);
                }
            }
        }
    }

    /// Fetch and decode the genesis of tokens seen for the first time
    async fn resolve_metadata(&self, cache: &UtxoCache) -> BTreeMap<String, TokenMetadataEntry> {
        let mut resolved = BTreeMap::new();
        let unseen: Vec<String> = self.store.read(|s| {
            cache
                .token_ids()
                .into_iter()
                .filter(|id| !s.token_metadata.contains_key(id))
                .collect()
        });

        for token_id in unseen {
            let scripts = match timed(self.timeout, self.chain.fetch_transaction(&token_id)).await
            {
                Ok(scripts) => scripts,
                Err(e) => {
                    log::warn!("Genesis fetch for {} failed, retrying next pass: {}", token_id, e);
                    continue;
                }
            };

            let entry = match scripts.first().map(|s| decode_genesis(s)) {
                Some(Ok(genesis)) => {
                    log::debug!("✓ Token {} is {} ({})", token_id, genesis.ticker, genesis.name);
                    TokenMetadataEntry::Known(TokenMetadata {
                        token_id: token_id.clone(),
                        ticker: genesis.ticker,
                        name: genesis.name,
                        decimals: genesis.decimals,
                    })
                }
                Some(Err(e)) => TokenMetadataEntry::Malformed {
                    reason: e.to_string(),
                },
                None => TokenMetadataEntry::Malformed {
                    reason: "genesis transaction has no outputs".to_string(),
                },
            };
            resolved.insert(token_id, entry);
        }

        resolved
    }

    /// Record transfers received by `address` since the last synced block
    ///
    /// Returns only the transfers not seen before. Transactions funded by the
    /// address itself are skipped; those are tracked as wallet transactions.
    pub async fn sync_history(&self, address: &str) -> Result<Vec<IncomingTransfer>, ReconcileError> {
        let indexer = self
            .indexer
            .as_ref()
            .ok_or(ReconcileError::NoHistoryIndexer)?;

        let lock = self.address_lock(address);
        let _guard = lock.lock().await;

        let (since, known) = self.store.read(|s| {
            s.accounts
                .get(address)
                .map(|a| {
                    (
                        a.synced_block,
                        a.incoming.iter().map(|t| t.txid.clone()).collect::<Vec<_>>(),
                    )
                })
                .unwrap_or_default()
        });

        let txs = timed(
            self.timeout,
            indexer.fetch_historical_transactions(address, since),
        )
        .await?;

        let mut cursor = since;
        let mut transfers = Vec::new();
        for tx in &txs {
            if let Some(height) = tx.block_height {
                cursor = cursor.max(height);
            }
            let seen = known.contains(&tx.txid)
                || transfers.iter().any(|t: &IncomingTransfer| t.txid == tx.txid);
            if seen {
                continue;
            }
            if let Some(transfer) = incoming_transfer(address, tx) {
                transfers.push(transfer);
            }
        }

        self.store.update(|state| {
            let account = state.accounts.entry(address.to_string()).or_default();
            account.synced_block = cursor;
            account.incoming.extend(transfers.iter().cloned());
        });
        self.persist()?;

        log::info!(
            "History sync for {}: {} new incoming transfers, synced to block {}",
            address,
            transfers.len(),
            cursor
        );

        Ok(transfers)
    }

    fn persist(&self) -> Result<(), ReconcileError> {
        if let Some(path) = &self.snapshot_path {
            save_json(path, &self.store.get())?;
        }
        Ok(())
    }
}

/// Interpret an indexed transaction as a transfer into `address`
fn incoming_transfer(address: &str, tx: &RawHistoricalTx) -> Option<IncomingTransfer> {
    if tx.input_addresses.iter().any(|a| a == address) {
        return None;
    }

    let payload = tx
        .output_scripts
        .first()
        .and_then(|script| hex::decode(script).ok());

    let mut amount_sats: u64 = 0;
    let mut token: Option<IncomingToken> = None;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.address != address {
            continue;
        }
        amount_sats = match amount_sats.checked_add(output.amount) {
            Some(total) => total,
            None => {
                log::warn!("Skipping {}: received amount overflows", tx.txid);
                return None;
            }
        };

        let decoded = payload
            .as_deref()
            .and_then(|p| decode_output_script(p, &tx.txid, index as u32).ok());
        if let Some(info) = decoded {
            match &mut token {
                Some(t) if t.token_id == info.token_id => {
                    t.quantity = match t.quantity.checked_add(info.quantity) {
                        Some(total) => total,
                        None => {
                            log::warn!("Skipping {}: token quantity overflows", tx.txid);
                            return None;
                        }
                    };
                }
                Some(_) => {}
                None => {
                    token = Some(IncomingToken {
                        token_id: info.token_id,
                        quantity: info.quantity,
                    })
                }
            }
        }
    }

    if amount_sats == 0 && token.is_none() {
        return None;
    }

    Some(IncomingTransfer {
        txid: tx.txid.clone(),
        block_height: tx.block_height,
        amount_sats,
        token,
    })
}
