//! Transaction controller - main integration layer
//!
//! Coordinates the state manager, the account reconciler, the pending tracker
//! and the external signer and broadcaster.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::account::{to_raw_amount, AccountReconciler, ReconcileError, ReconcilerState};
use crate::chain::{timed, ChainSource, NetworkError, Signer};
use crate::config::WalletSettings;
use crate::tx::builder::{
    build_base_send, build_token_send, BuildError, FeePolicy, UnsignedTransaction,
};
use crate::tx::meta::{ErrorKind, TxFailure, TxLifecycle, TxMeta, TxParams, TxStatus, TxType};
use crate::tx::pending_tracker::{Clock, PendingTxTracker, SystemClock, TrackerEvent};
use crate::tx::state_manager::{BootRecovery, TxEvent, TxQuery, TxStateError, TxStateManager};
use crate::types::{OutPoint, Utxo};

/// Errors that can occur in the transaction controller
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Invalid transaction: {0}")]
    Validation(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("State error: {0}")]
    State(#[from] TxStateError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl ControllerError {
    /// Classification attached to failed transactions
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Validation(_) => ErrorKind::Validation,
            ControllerError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            ControllerError::Build(e) => match e {
                BuildError::InsufficientFunds { .. } | BuildError::InsufficientTokens { .. } => {
                    ErrorKind::InsufficientFunds
                }
                BuildError::InvalidAmount(_) => ErrorKind::Validation,
                BuildError::Script(_) => ErrorKind::ProtocolDecode,
            },
            ControllerError::State(e) => match e {
                TxStateError::NotFound(_) => ErrorKind::Validation,
                _ => ErrorKind::InvariantViolation,
            },
            ControllerError::Reconcile(e) => match e {
                ReconcileError::Network(n) => network_kind(n),
                ReconcileError::NoHistoryIndexer => ErrorKind::Validation,
                ReconcileError::Storage(_) => ErrorKind::InvariantViolation,
            },
            ControllerError::Network(e) => network_kind(e),
        }
    }

    fn to_failure(&self) -> TxFailure {
        TxFailure::new(self.kind(), self.to_string())
    }
}

fn network_kind(e: &NetworkError) -> ErrorKind {
    if e.is_transient() {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::ChainRejection
    }
}

/// Top-level orchestrator for outgoing transactions
///
/// # Example
///
/// ```ignore
/// let controller = TransactionController::new(state, reconciler, chain, signer, &settings);
/// controller.init()?;
///
/// let meta = controller.create_transaction(TxParams::send(from, to, 50_000))?;
/// let hash = controller.approve_and_send(&meta.id).await?;
/// ```
pub struct TransactionController {
    state: Arc<TxStateManager>,
    reconciler: Arc<AccountReconciler>,
    tracker: PendingTxTracker,
    chain: Arc<dyn ChainSource>,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    settings: WalletSettings,
    /// Held from coin selection until the inputs are recorded as signed
    sender_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransactionController {
    pub fn new(
        state: Arc<TxStateManager>,
        reconciler: Arc<AccountReconciler>,
        chain: Arc<dyn ChainSource>,
        signer: Arc<dyn Signer>,
        settings: &WalletSettings,
    ) -> Self {
        let tracker = PendingTxTracker::new(
            state.clone(),
            chain.clone(),
            settings.request_timeout(),
            settings.retry_after(),
        );

        Self {
            state,
            reconciler,
            tracker,
            chain,
            signer,
            clock: Arc::new(SystemClock),
            settings: settings.clone(),
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the wall clock, e.g. with a `ManualClock` in tests
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn timeout(&self) -> Duration {
        self.settings.request_timeout()
    }

    fn sender_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.sender_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Boot recovery
    ///
    /// Recomputes defaults for transactions interrupted while loading them and
    /// fails transactions interrupted mid-signing.
    pub fn init(&self) -> Result<BootRecovery, ControllerError> {
        let recovery = self
            .state
            .recover_on_boot(|meta| self.fill_defaults(meta.params.clone()))?;
        Ok(recovery)
    }

    fn fill_defaults(&self, mut params: TxParams) -> Result<TxParams, TxFailure> {
        let fee_rate = params
            .fee_rate
            .unwrap_or(self.settings.fee_rate_sat_per_byte);
        if fee_rate == 0 {
            return Err(TxFailure::new(
                ErrorKind::Validation,
                "Fee rate must be greater than zero",
            ));
        }
        params.fee_rate = Some(fee_rate);
        Ok(params)
    }

    /// Reject malformed requests before anything is stored
    fn validate_params(&self, params: &TxParams) -> Result<(), ControllerError> {
        if params.from.trim().is_empty() {
            return Err(ControllerError::Validation(
                "Sender address is empty".to_string(),
            ));
        }
        if params.to.trim().is_empty() {
            return Err(ControllerError::Validation(
                "Recipient address is empty".to_string(),
            ));
        }

        match &params.token {
            Some(token) => {
                if token.amount.is_sign_negative() {
                    return Err(ControllerError::Validation(format!(
                        "Token amount must not be negative: {}",
                        token.amount
                    )));
                }
                if let Some(meta) = self.reconciler.token_metadata(&token.token_id) {
                    if to_raw_amount(token.amount, meta.decimals).is_none() {
                        return Err(ControllerError::Validation(format!(
                            "{} has more than {} decimals",
                            token.amount, meta.decimals
                        )));
                    }
                }
            }
            None => {
                if params.value_sats == 0 {
                    return Err(ControllerError::Validation(
                        "Amount must be greater than zero".to_string(),
                    ));
                }
            }
        }

        if let Some(balances) = self.reconciler.reconciled_balances(&params.from) {
            match &params.token {
                Some(token) if balances.token(&token.token_id) < token.amount => {
                    return Err(ControllerError::InsufficientFunds(format!(
                        "{} {} requested, {} available",
                        token.amount,
                        token.token_id,
                        balances.token(&token.token_id)
                    )));
                }
                None if params.value_sats > balances.base_currency_available => {
                    return Err(ControllerError::InsufficientFunds(format!(
                        "{} sats requested, {} sats available",
                        params.value_sats, balances.base_currency_available
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Validate a request and store it as an unapproved transaction
    pub fn create_transaction(&self, params: TxParams) -> Result<TxMeta, ControllerError> {
        self.validate_params(&params)?;
        let meta = self.state.generate_tx_meta(params);
        self.store_new(meta)
    }

    /// Store a freshly generated record and fill in its defaults
    fn store_new(&self, meta: TxMeta) -> Result<TxMeta, ControllerError> {
        let meta = self.state.add_tx(meta)?;

        match self.fill_defaults(meta.params.clone()) {
            Ok(params) => {
                self.state.update_tx(&meta.id, params)?;
                Ok(self.state.set_loading_defaults(&meta.id, false)?)
            }
            Err(failure) => Ok(self.state.set_tx_status_failed(&meta.id, failure)?),
        }
    }

    /// Approve, build, sign and broadcast a transaction
    ///
    /// Returns the transaction hash once submitted. Any error after approval
    /// fails the transaction with the error attached.
    pub async fn approve_and_send(&self, id: &str) -> Result<String, ControllerError> {
        self.state.set_tx_status_approved(id)?;

        match self.sign_and_submit(id).await {
            Ok(hash) => Ok(hash),
            Err(e) => {
                log::warn!("Sending {} failed: {}", id, e);
                let still_open = self
                    .state
                    .get_tx(id)
                    .map(|m| !m.status().is_terminal())
                    .unwrap_or(false);
                if still_open {
                    if let Err(inner) = self.state.set_tx_status_failed(id, e.to_failure()) {
                        log::error!("Could not mark {} as failed: {}", id, inner);
                    }
                }
                Err(e)
            }
        }
    }

    async fn sign_and_submit(&self, id: &str) -> Result<String, ControllerError> {
        let meta = self.state.get_tx(id)?;
        let lock = self.sender_lock(&meta.params.from);
        let guard = lock.lock().await;
        let unsigned = self.build_unsigned(&meta)?;

        log::info!(
            "Signing {} ({} inputs, {} outputs, fee {} sats)",
            id,
            unsigned.inputs.len(),
            unsigned.outputs.len(),
            unsigned.fee
        );

        let raw_tx = timed(
            self.timeout(),
            self.signer.sign(&unsigned, &meta.params.from),
        )
        .await?;
        self.state
            .set_tx_status_signed(id, raw_tx.clone(), unsigned.input_outpoints())?;
        drop(guard);

        let hash = timed(
            self.timeout(),
            self.chain.broadcast_raw_transaction(&raw_tx),
        )
        .await?;
        self.state
            .set_tx_status_submitted(id, hash.clone(), self.clock.now())?;

        log::info!("✓ Broadcast {} as {}", id, hash);
        Ok(hash)
    }

    /// Outpoints consumed by signed or submitted transactions
    fn in_flight_outpoints(&self) -> Result<HashSet<OutPoint>, ControllerError> {
        Ok(self
            .state
            .get_tx_list()?
            .iter()
            .flat_map(|m| m.in_flight_inputs().iter().cloned())
            .collect())
    }

    /// Build the unsigned transaction for `meta` from the reconciled UTXO set
    pub fn build_unsigned(&self, meta: &TxMeta) -> Result<UnsignedTransaction, ControllerError> {
        let params = &meta.params;
        let policy = FeePolicy {
            fee_rate: params
                .fee_rate
                .unwrap_or(self.settings.fee_rate_sat_per_byte),
            dust_limit: self.settings.dust_limit_sats,
        };

        let in_flight = self.in_flight_outpoints()?;
        let available = |utxos: Vec<Utxo>| -> Vec<Utxo> {
            utxos
                .into_iter()
                .filter(|u| !in_flight.contains(&u.outpoint))
                .collect()
        };
        let base = available(self.reconciler.spendable_utxos(&params.from));

        let unsigned = match &params.token {
            None => build_base_send(&base, &params.from, &params.to, params.value_sats, policy)?,
            Some(token) => {
                let token_meta = self
                    .reconciler
                    .token_metadata(&token.token_id)
                    .ok_or_else(|| {
                        ControllerError::Validation(format!("Unknown token {}", token.token_id))
                    })?;
                let raw_amount = to_raw_amount(token.amount, token_meta.decimals).ok_or_else(|| {
                    ControllerError::Validation(format!(
                        "Invalid amount {} for {} decimals",
                        token.amount, token_meta.decimals
                    ))
                })?;
                let token_inputs =
                    available(self.reconciler.token_utxos(&params.from, &token.token_id));
                build_token_send(
                    &token_inputs,
                    &base,
                    &params.from,
                    &params.to,
                    &token.token_id,
                    raw_amount,
                    policy,
                )?
            }
        };

        Ok(unsigned)
    }

    /// Reject a transaction that has not been broadcast
    pub fn cancel(&self, id: &str) -> Result<TxMeta, ControllerError> {
        let meta = self.state.set_tx_status_rejected(id)?;
        log::info!("Cancelled {}", id);
        Ok(meta)
    }

    /// Create a new transaction with the parameters of `original_id`
    ///
    /// The original record is left untouched.
    pub fn retry(&self, original_id: &str) -> Result<TxMeta, ControllerError> {
        let original = self.state.get_tx(original_id)?;
        let meta = self.state.generate_with_type(
            original.params.clone(),
            TxType::Retry {
                original_id: original.id.clone(),
            },
        );
        log::info!("Retrying {} as {}", original_id, meta.id);
        self.store_new(meta)
    }

    /// Apply one tracker observation to the state manager
    pub async fn apply_tracker_event(&self, event: &TrackerEvent) -> Result<(), ControllerError> {
        match event {
            TrackerEvent::Confirmed { id, block_height } => {
                let meta = self.state.set_tx_status_confirmed(id, Some(*block_height))?;
                self.resync(&meta.params.from).await;
            }
            TrackerEvent::Warning { meta, error } => {
                log::warn!("Could not check {}: {}", meta.id, error);
            }
            TrackerEvent::Failed { id, error } => {
                self.state.set_tx_status_failed(id, error.clone())?;
            }
            TrackerEvent::Dropped { id } => {
                let meta = self.state.set_tx_status_dropped(id)?;
                self.resync(&meta.params.from).await;
            }
            TrackerEvent::Retry { meta } => {
                let meta = self.state.increment_retry_count(&meta.id)?;
                if let TxLifecycle::Submitted { raw_tx, .. } = &meta.lifecycle {
                    match timed(self.timeout(), self.chain.broadcast_raw_transaction(raw_tx)).await
                    {
                        Ok(hash) => log::info!(
                            "Rebroadcast {} as {} (retry {})",
                            meta.id,
                            hash,
                            meta.retry_count
                        ),
                        Err(e) => log::warn!("Rebroadcast of {} failed: {}", meta.id, e),
                    }
                }
            }
        }
        Ok(())
    }

    async fn resync(&self, address: &str) {
        if !self.reconciler.is_tracked(address) {
            return;
        }
        if let Err(e) = self.reconciler.reconcile(address).await {
            log::warn!("Re-sync of {} failed: {}", address, e);
        }
    }

    /// Run the tracker once and apply what it found
    pub async fn poll_pending(&self) -> Result<Vec<TrackerEvent>, ControllerError> {
        let events = self.tracker.update_pending_txs(self.clock.now()).await?;
        for event in &events {
            if let Err(e) = self.apply_tracker_event(event).await {
                log::error!("Could not apply tracker event for {}: {}", event.tx_id(), e);
            }
        }
        Ok(events)
    }

    /// Poll pending transactions every `interval` until `shutdown` turns true
    pub async fn run_tracker(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_pending().await {
                        log::warn!("Pending transaction poll failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::debug!("Tracker loop stopped");
                        break;
                    }
                }
            }
        }
    }

    pub fn get_tx(&self, id: &str) -> Result<TxMeta, ControllerError> {
        Ok(self.state.get_tx(id)?)
    }

    pub fn list_transactions(&self, query: &TxQuery) -> Result<Vec<TxMeta>, ControllerError> {
        Ok(self.state.get_filtered_tx_list(query)?)
    }

    pub fn pending_transactions(&self, address: Option<&str>) -> Result<Vec<TxMeta>, ControllerError> {
        Ok(self.state.get_pending_transactions(address)?)
    }

    pub fn confirmed_transactions(
        &self,
        address: Option<&str>,
    ) -> Result<Vec<TxMeta>, ControllerError> {
        Ok(self.state.get_confirmed_transactions(address)?)
    }

    /// Transactions that have not reached a terminal status
    pub fn open_transactions(&self) -> Result<Vec<TxMeta>, ControllerError> {
        Ok(self
            .state
            .get_tx_list()?
            .into_iter()
            .filter(|m| !m.status().is_terminal())
            .collect())
    }

    pub fn subscribe_tx_events(&self) -> broadcast::Receiver<TxEvent> {
        self.state.subscribe()
    }

    pub fn subscribe_tracker_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.tracker.subscribe()
    }

    pub fn subscribe_balances(&self) -> watch::Receiver<ReconcilerState> {
        self.reconciler.subscribe()
    }

    pub fn state_manager(&self) -> &Arc<TxStateManager> {
        &self.state
    }

    pub fn reconciler(&self) -> &Arc<AccountReconciler> {
        &self.reconciler
    }
}

/// Count of records per status, for summaries
pub fn status_counts(metas: &[TxMeta]) -> Vec<(TxStatus, usize)> {
    let mut counts: Vec<(TxStatus, usize)> = Vec::new();
    for meta in metas {
        match counts.iter_mut().find(|(s, _)| *s == meta.status()) {
            Some((_, n)) => *n += 1,
            None => counts.push((meta.status(), 1)),
        }
    }
    counts
}
