//! Pending transaction tracker
//!
//! Checks every submitted transaction against the chain and reports what it
//! found as [`TrackerEvent`]s. The tracker never changes a record itself;
//! the controller applies the events. It owns no timer either: callers invoke
//! [`PendingTxTracker::update_pending_txs`] with the current time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::chain::{timed, ChainSource, Inclusion};
use crate::tx::meta::{ErrorKind, TxFailure, TxId, TxLifecycle, TxMeta};
use crate::tx::state_manager::{TxStateError, TxStateManager};

const EVENT_CAPACITY: usize = 256;

/// Largest exponent applied to the retry threshold
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock advanced by hand, for deterministic scheduling
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Observations about submitted transactions
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// `tx:confirmed`
    Confirmed { id: TxId, block_height: u32 },
    /// `tx:warning`; the query failed transiently and nothing changed
    Warning { meta: Box<TxMeta>, error: String },
    /// `tx:failed`; the chain reported the transaction invalid
    Failed { id: TxId, error: TxFailure },
    /// `tx:retry`; submitted long enough ago without inclusion
    Retry { meta: Box<TxMeta> },
    /// No queried source knows the transaction any more
    Dropped { id: TxId },
}

impl TrackerEvent {
    pub fn tx_id(&self) -> &str {
        match self {
            TrackerEvent::Confirmed { id, .. }
            | TrackerEvent::Failed { id, .. }
            | TrackerEvent::Dropped { id } => id,
            TrackerEvent::Warning { meta, .. } | TrackerEvent::Retry { meta } => &meta.id,
        }
    }
}

pub struct PendingTxTracker {
    state: Arc<TxStateManager>,
    chain: Arc<dyn ChainSource>,
    timeout: Duration,
    retry_after: chrono::Duration,
    events: broadcast::Sender<TrackerEvent>,
}

impl PendingTxTracker {
    /// # Arguments
    ///
    /// * `timeout` - Deadline for each status query
    /// * `retry_after` - Age at which an unconfirmed transaction is first retried;
    ///   doubles with every retry
    pub fn new(
        state: Arc<TxStateManager>,
        chain: Arc<dyn ChainSource>,
        timeout: Duration,
        retry_after: chrono::Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state,
            chain,
            timeout,
            retry_after,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Age a transaction must reach before its next retry
    pub fn retry_threshold(&self, retry_count: u32) -> chrono::Duration {
        self.retry_after * 2i32.pow(retry_count.min(MAX_BACKOFF_EXPONENT))
    }

    /// Query every submitted transaction once
    ///
    /// Events are returned and also published to subscribers. Records that
    /// reached a terminal status are no longer submitted and are skipped.
    pub async fn update_pending_txs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrackerEvent>, TxStateError> {
        let pending = self.state.get_pending_transactions(None)?;
        let mut events = Vec::with_capacity(pending.len());

        for meta in pending {
            if let Some(event) = self.check(meta, now).await {
                let _ = self.events.send(event.clone());
                events.push(event);
            }
        }

        if !events.is_empty() {
            log::info!("Pending tracker produced {} events", events.len());
        }

        Ok(events)
    }

    async fn check(&self, meta: TxMeta, now: DateTime<Utc>) -> Option<TrackerEvent> {
        let (hash, submitted_at) = match &meta.lifecycle {
            TxLifecycle::Submitted {
                hash, submitted_at, ..
            } => (hash.clone(), *submitted_at),
            _ => return None,
        };

        let status = timed(self.timeout, self.chain.transaction_status(&hash)).await;

        match status {
            Ok(Inclusion::Confirmed { block_height }) => {
                log::debug!("✓ {} included at height {}", hash, block_height);
                Some(TrackerEvent::Confirmed {
                    id: meta.id,
                    block_height,
                })
            }
            Ok(Inclusion::Invalid { reason }) => Some(TrackerEvent::Failed {
                id: meta.id,
                error: TxFailure::new(ErrorKind::ChainRejection, reason),
            }),
            Ok(Inclusion::NotFound) => {
                // Nodes can lag behind a fresh broadcast
                if now - submitted_at < self.retry_threshold(meta.retry_count) {
                    log::debug!("{} not yet visible to the chain source", hash);
                    return None;
                }
                log::warn!("Transaction {} unknown to the chain", hash);
                Some(TrackerEvent::Dropped { id: meta.id })
            }
            Ok(Inclusion::Pending) => {
                if now - submitted_at >= self.retry_threshold(meta.retry_count) {
                    Some(TrackerEvent::Retry {
                        meta: Box::new(meta),
                    })
                } else {
                    None
                }
            }
            Err(e) => {
                log::warn!("Status query for {} failed: {}", hash, e);
                Some(TrackerEvent::Warning {
                    meta: Box::new(meta),
                    error: e.to_string(),
                })
            }
        }
    }
}
