//! Transaction state manager
//!
//! Owns every `TxMeta` the wallet created, validates status transitions,
//! persists records and publishes transition events.
//!
//! Legal transitions:
//!
//! ```text
//! unapproved -> approved -> signed -> submitted -> {confirmed | dropped}
//! {unapproved | approved} -> rejected
//! any non-terminal -> failed
//! ```

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::WalletSettings;
use crate::storage::{StorageError, TxStorage};
use crate::tx::meta::{
    ErrorKind, TxChange, TxFailure, TxId, TxLifecycle, TxMeta, TxParams, TxStatus, TxType,
};
use crate::types::OutPoint;

const EVENT_CAPACITY: usize = 256;

/// Message attached to transactions found mid-signing at boot
pub const APPROVED_AT_BOOT_MESSAGE: &str =
    "Transaction found as \"approved\" during boot - possibly stuck during signing";

/// Errors raised by the state manager
#[derive(Debug, thiserror::Error)]
pub enum TxStateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction not found: {0}")]
    NotFound(TxId),

    /// A caller attempted a transition the state machine does not allow
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TxId,
        from: TxStatus,
        to: TxStatus,
    },

    #[error("Transaction {id} cannot be edited in status {status}")]
    NotEditable { id: TxId, status: TxStatus },

    #[error("State lock poisoned")]
    Poisoned,
}

/// Transition notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEvent {
    /// `tx:added`
    Added { id: TxId },
    /// `${id}:status-update`
    StatusUpdate { id: TxId, status: TxStatus },
    /// `${id}:finished`
    Finished { id: TxId, status: TxStatus },
}

/// Conjunctive filter over transaction records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxQuery {
    pub status: Option<TxStatus>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub loading_defaults: Option<bool>,
    pub retry: Option<bool>,
}

impl TxQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TxStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to = Some(address.into());
        self
    }

    pub fn loading_defaults(mut self, loading: bool) -> Self {
        self.loading_defaults = Some(loading);
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn matches(&self, meta: &TxMeta) -> bool {
        self.status.map_or(true, |s| meta.status() == s)
            && self.from.as_ref().map_or(true, |f| &meta.params.from == f)
            && self.to.as_ref().map_or(true, |t| &meta.params.to == t)
            && self
                .loading_defaults
                .map_or(true, |l| meta.loading_defaults == l)
            && self.retry.map_or(true, |r| {
                matches!(meta.tx_type, TxType::Retry { .. }) == r
            })
    }
}

/// Outcome of boot recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootRecovery {
    pub defaults_restored: usize,
    pub failed: usize,
}

/// Statuses a transition into `target` may start from
fn predecessors(target: TxStatus) -> &'static [TxStatus] {
    use TxStatus::*;
    match target {
        Unapproved => &[],
        Approved => &[Unapproved],
        Signed => &[Approved],
        Submitted => &[Signed],
        Confirmed | Dropped => &[Submitted],
        Rejected => &[Unapproved, Approved],
        Failed => &[Unapproved, Approved, Signed, Submitted],
    }
}

pub struct TxStateManager {
    store: Mutex<TxStorage>,
    events: broadcast::Sender<TxEvent>,
    tx_history_limit: usize,
    network_id: u32,
}

impl TxStateManager {
    pub fn new(store: TxStorage, settings: &WalletSettings, network_id: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store: Mutex::new(store),
            events,
            tx_history_limit: settings.tx_history_limit.max(1),
            network_id,
        }
    }

    /// Subscribe to transition events; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    fn store(&self) -> Result<MutexGuard<'_, TxStorage>, TxStateError> {
        self.store.lock().map_err(|_| TxStateError::Poisoned)
    }

    fn emit(&self, event: TxEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create a new unapproved record (not yet stored)
    pub fn generate_tx_meta(&self, params: TxParams) -> TxMeta {
        self.generate_with_type(params, TxType::Standard)
    }

    pub fn generate_with_type(&self, params: TxParams, tx_type: TxType) -> TxMeta {
        let mut meta = TxMeta {
            id: Uuid::new_v4().to_string(),
            time: Utc::now(),
            params,
            lifecycle: TxLifecycle::Unapproved,
            tx_type,
            retry_count: 0,
            loading_defaults: true,
            network_id: self.network_id,
            history: Vec::new(),
        };
        let snapshot = Box::new(meta.snapshot());
        meta.history.push(crate::tx::meta::HistoryEntry {
            timestamp: meta.time,
            note: "created".to_string(),
            change: TxChange::Created { snapshot },
        });
        meta
    }

    /// Store a new record, evicting old finished records past the history limit
    pub fn add_tx(&self, meta: TxMeta) -> Result<TxMeta, TxStateError> {
        {
            let mut store = self.store()?;
            let same_sender: Vec<TxMeta> = store
                .all()?
                .into_iter()
                .filter(|m| m.params.from == meta.params.from)
                .collect();

            let excess = (same_sender.len() + 1).saturating_sub(self.tx_history_limit);
            if excess > 0 {
                let evicted: Vec<TxId> = same_sender
                    .iter()
                    .filter(|m| m.status().is_terminal())
                    .take(excess)
                    .map(|m| m.id.clone())
                    .collect();
                if !evicted.is_empty() {
                    log::debug!(
                        "Evicting {} finished transactions of {}",
                        evicted.len(),
                        meta.params.from
                    );
                }
                store.remove(&evicted)?;
            }

            store.insert(&meta)?;
        }

        log::info!("Added transaction {} from {}", meta.id, meta.params.from);
        self.emit(TxEvent::Added {
            id: meta.id.clone(),
        });
        Ok(meta)
    }

    pub fn get_tx(&self, id: &str) -> Result<TxMeta, TxStateError> {
        self.store()?
            .get(id)?
            .ok_or_else(|| TxStateError::NotFound(id.to_string()))
    }

    /// All records in creation order
    pub fn get_tx_list(&self) -> Result<Vec<TxMeta>, TxStateError> {
        Ok(self.store()?.all()?)
    }

    pub fn get_filtered_tx_list(&self, query: &TxQuery) -> Result<Vec<TxMeta>, TxStateError> {
        Ok(self
            .store()?
            .all()?
            .into_iter()
            .filter(|m| query.matches(m))
            .collect())
    }

    pub fn get_pending_transactions(
        &self,
        address: Option<&str>,
    ) -> Result<Vec<TxMeta>, TxStateError> {
        let mut query = TxQuery::new().status(TxStatus::Submitted);
        query.from = address.map(str::to_string);
        self.get_filtered_tx_list(&query)
    }

    pub fn get_confirmed_transactions(
        &self,
        address: Option<&str>,
    ) -> Result<Vec<TxMeta>, TxStateError> {
        let mut query = TxQuery::new().status(TxStatus::Confirmed);
        query.from = address.map(str::to_string);
        self.get_filtered_tx_list(&query)
    }

    /// Read-modify-write of one record under the store lock
    fn mutate<F>(&self, id: &str, note: &str, f: F) -> Result<TxMeta, TxStateError>
    where
        F: FnOnce(&TxMeta) -> Result<TxChange, TxStateError>,
    {
        let mut store = self.store()?;
        let mut meta = store
            .get(id)?
            .ok_or_else(|| TxStateError::NotFound(id.to_string()))?;
        let change = f(&meta)?;
        meta.record(change, note);
        store.update(&meta)?;
        Ok(meta)
    }

    /// Edit parameters of a transaction that has not been approved yet
    pub fn update_tx(&self, id: &str, params: TxParams) -> Result<TxMeta, TxStateError> {
        self.mutate(id, "params updated", |meta| {
            ensure_editable(meta)?;
            Ok(TxChange::Params { params })
        })
    }

    pub fn set_loading_defaults(&self, id: &str, loading: bool) -> Result<TxMeta, TxStateError> {
        self.mutate(id, "loading defaults", |meta| {
            ensure_editable(meta)?;
            Ok(TxChange::LoadingDefaults {
                loading_defaults: loading,
            })
        })
    }

    /// Bump the retry counter; only the retry listener calls this
    pub fn increment_retry_count(&self, id: &str) -> Result<TxMeta, TxStateError> {
        self.mutate(id, "retry", |meta| {
            Ok(TxChange::RetryCount {
                retry_count: meta.retry_count.saturating_add(1),
            })
        })
    }

    /// Transition `id` to `target`
    ///
    /// `build` derives the new lifecycle from the record as read under the
    /// store lock, after the transition has been checked.
    fn set_status<F>(&self, id: &str, target: TxStatus, build: F) -> Result<TxMeta, TxStateError>
    where
        F: FnOnce(&TxMeta) -> Result<TxLifecycle, TxStateError>,
    {
        let note = format!("status: {}", target);
        let result = self.mutate(id, &note, |meta| {
            let current = meta.status();
            if !predecessors(target).contains(&current) {
                return Err(TxStateError::InvalidTransition {
                    id: meta.id.clone(),
                    from: current,
                    to: target,
                });
            }
            Ok(TxChange::Status {
                lifecycle: build(meta)?,
            })
        });

        let meta = match result {
            Ok(meta) => meta,
            Err(e @ TxStateError::InvalidTransition { .. }) => {
                log::error!("Rejected state transition: {}", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        log::info!("Transaction {} -> {}", id, target);
        self.emit(TxEvent::StatusUpdate {
            id: id.to_string(),
            status: target,
        });
        if target.is_terminal() {
            self.emit(TxEvent::Finished {
                id: id.to_string(),
                status: target,
            });
        }
        Ok(meta)
    }

    pub fn set_tx_status_approved(&self, id: &str) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Approved, |_| Ok(TxLifecycle::Approved))
    }

    pub fn set_tx_status_signed(
        &self,
        id: &str,
        raw_tx: String,
        inputs: Vec<OutPoint>,
    ) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Signed, |_| {
            Ok(TxLifecycle::Signed { raw_tx, inputs })
        })
    }

    /// Move a signed transaction to submitted; carries over the signed bytes
    pub fn set_tx_status_submitted(
        &self,
        id: &str,
        hash: String,
        submitted_at: DateTime<Utc>,
    ) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Submitted, |meta| match &meta.lifecycle {
            TxLifecycle::Signed { raw_tx, inputs } => Ok(TxLifecycle::Submitted {
                hash,
                raw_tx: raw_tx.clone(),
                inputs: inputs.clone(),
                submitted_at,
            }),
            other => Err(TxStateError::InvalidTransition {
                id: meta.id.clone(),
                from: other.status(),
                to: TxStatus::Submitted,
            }),
        })
    }

    pub fn set_tx_status_confirmed(
        &self,
        id: &str,
        block_height: Option<u32>,
    ) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Confirmed, |meta| {
            Ok(TxLifecycle::Confirmed {
                hash: current_hash(meta),
                block_height,
            })
        })
    }

    pub fn set_tx_status_dropped(&self, id: &str) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Dropped, |meta| {
            Ok(TxLifecycle::Dropped {
                hash: current_hash(meta),
            })
        })
    }

    pub fn set_tx_status_failed(&self, id: &str, error: TxFailure) -> Result<TxMeta, TxStateError> {
        log::warn!("Transaction {} failed: {}", id, error);
        self.set_status(id, TxStatus::Failed, |meta| {
            Ok(TxLifecycle::Failed {
                hash: meta.hash().map(str::to_string),
                error,
            })
        })
    }

    pub fn set_tx_status_rejected(&self, id: &str) -> Result<TxMeta, TxStateError> {
        self.set_status(id, TxStatus::Rejected, |_| Ok(TxLifecycle::Rejected))
    }

    /// Clean up records left behind by an interrupted process
    ///
    /// Unapproved records still loading defaults get their defaults recomputed
    /// by `fill_defaults`, or fail when that is impossible. Approved records were
    /// interrupted mid-signing and always fail.
    pub fn recover_on_boot<F>(&self, mut fill_defaults: F) -> Result<BootRecovery, TxStateError>
    where
        F: FnMut(&TxMeta) -> Result<TxParams, TxFailure>,
    {
        let mut outcome = BootRecovery::default();

        let loading = self.get_filtered_tx_list(
            &TxQuery::new()
                .status(TxStatus::Unapproved)
                .loading_defaults(true),
        )?;
        for meta in loading {
            match fill_defaults(&meta) {
                Ok(params) => {
                    self.update_tx(&meta.id, params)?;
                    self.set_loading_defaults(&meta.id, false)?;
                    outcome.defaults_restored += 1;
                }
                Err(error) => {
                    self.set_tx_status_failed(&meta.id, error)?;
                    outcome.failed += 1;
                }
            }
        }

        let approved = self.get_filtered_tx_list(&TxQuery::new().status(TxStatus::Approved))?;
        for meta in approved {
            self.set_tx_status_failed(
                &meta.id,
                TxFailure::new(ErrorKind::InvariantViolation, APPROVED_AT_BOOT_MESSAGE),
            )?;
            outcome.failed += 1;
        }

        if outcome.defaults_restored + outcome.failed > 0 {
            log::info!(
                "Boot recovery: {} defaults restored, {} failed",
                outcome.defaults_restored,
                outcome.failed
            );
        }

        Ok(outcome)
    }
}

/// Hash of a submitted record; only submitted records reach this
fn current_hash(meta: &TxMeta) -> String {
    meta.hash().map(str::to_string).unwrap_or_default()
}

fn ensure_editable(meta: &TxMeta) -> Result<(), TxStateError> {
    if meta.status() != TxStatus::Unapproved {
        return Err(TxStateError::NotEditable {
            id: meta.id.clone(),
            status: meta.status(),
        });
    }
    Ok(())
}
