//! Canonical transaction record
//!
//! `TxMeta` is the wallet's record of a transaction it created. Its lifecycle is
//! a closed sum type: data that only exists from a given status onward (signed
//! bytes, hash, error) lives inside that status variant.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::OutPoint;

/// Identifier assigned at creation
pub type TxId = String;

/// Error classification shared by the lifecycle and the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InsufficientFunds,
    TransientNetwork,
    ProtocolDecode,
    ChainRejection,
    InvariantViolation,
}

/// Error attached to a failed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFailure {
    pub kind: ErrorKind,
    /// Human-readable message shown to the user
    pub message: String,
}

impl TxFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Field-less status used for queries and transition checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Unapproved,
    Approved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
    Rejected,
    Dropped,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Rejected | TxStatus::Dropped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Unapproved => "unapproved",
            TxStatus::Approved => "approved",
            TxStatus::Signed => "signed",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Rejected => "rejected",
            TxStatus::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unapproved" => Ok(TxStatus::Unapproved),
            "approved" => Ok(TxStatus::Approved),
            "signed" => Ok(TxStatus::Signed),
            "submitted" => Ok(TxStatus::Submitted),
            "confirmed" => Ok(TxStatus::Confirmed),
            "failed" => Ok(TxStatus::Failed),
            "rejected" => Ok(TxStatus::Rejected),
            "dropped" => Ok(TxStatus::Dropped),
            other => Err(format!("Invalid status '{}'", other)),
        }
    }
}

/// Lifecycle state with the data valid for that state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxLifecycle {
    Unapproved,
    Approved,
    Signed {
        raw_tx: String,
        inputs: Vec<OutPoint>,
    },
    Submitted {
        hash: String,
        raw_tx: String,
        inputs: Vec<OutPoint>,
        submitted_at: DateTime<Utc>,
    },
    Confirmed {
        hash: String,
        block_height: Option<u32>,
    },
    Failed {
        hash: Option<String>,
        error: TxFailure,
    },
    Rejected,
    Dropped {
        hash: String,
    },
}

impl TxLifecycle {
    pub fn status(&self) -> TxStatus {
        match self {
            TxLifecycle::Unapproved => TxStatus::Unapproved,
            TxLifecycle::Approved => TxStatus::Approved,
            TxLifecycle::Signed { .. } => TxStatus::Signed,
            TxLifecycle::Submitted { .. } => TxStatus::Submitted,
            TxLifecycle::Confirmed { .. } => TxStatus::Confirmed,
            TxLifecycle::Failed { .. } => TxStatus::Failed,
            TxLifecycle::Rejected => TxStatus::Rejected,
            TxLifecycle::Dropped { .. } => TxStatus::Dropped,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            TxLifecycle::Submitted { hash, .. }
            | TxLifecycle::Confirmed { hash, .. }
            | TxLifecycle::Dropped { hash } => Some(hash),
            TxLifecycle::Failed { hash, .. } => hash.as_deref(),
            _ => None,
        }
    }
}

/// Token leg of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub token_id: String,
    /// Amount in display units (scaled by the token's decimals)
    pub amount: Decimal,
}

/// Parameters of a requested transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: String,
    pub to: String,
    /// Base currency sent to the recipient, in satoshis
    pub value_sats: u64,
    /// Fee rate in satoshis per byte (filled in with defaults when absent)
    pub fee_rate: Option<u64>,
    pub token: Option<TokenTransfer>,
}

impl TxParams {
    pub fn send(from: impl Into<String>, to: impl Into<String>, value_sats: u64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            value_sats,
            fee_rate: None,
            token: None,
        }
    }

    pub fn send_token(
        from: impl Into<String>,
        to: impl Into<String>,
        token_id: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            value_sats: 0,
            fee_rate: None,
            token: Some(TokenTransfer {
                token_id: token_id.into(),
                amount,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxType {
    Standard,
    Retry { original_id: TxId },
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxChange {
    Created { snapshot: Box<TxMeta> },
    Status { lifecycle: TxLifecycle },
    Params { params: TxParams },
    RetryCount { retry_count: u32 },
    LoadingDefaults { loading_defaults: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub note: String,
    pub change: TxChange,
}

/// Canonical transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub id: TxId,
    pub time: DateTime<Utc>,
    pub params: TxParams,
    pub lifecycle: TxLifecycle,
    pub tx_type: TxType,
    pub retry_count: u32,
    pub loading_defaults: bool,
    pub network_id: u32,
    /// Append-only audit log; the first entry is the creation snapshot
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TxMeta {
    pub fn status(&self) -> TxStatus {
        self.lifecycle.status()
    }

    pub fn hash(&self) -> Option<&str> {
        self.lifecycle.hash()
    }

    pub fn err(&self) -> Option<&TxFailure> {
        match &self.lifecycle {
            TxLifecycle::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Outpoints consumed by this transaction while it is in flight
    pub fn in_flight_inputs(&self) -> &[OutPoint] {
        match &self.lifecycle {
            TxLifecycle::Signed { inputs, .. } | TxLifecycle::Submitted { inputs, .. } => inputs,
            _ => &[],
        }
    }

    /// Copy of the record without its history, used as the creation snapshot
    pub(crate) fn snapshot(&self) -> TxMeta {
        TxMeta {
            history: Vec::new(),
            ..self.clone()
        }
    }

    /// Apply a change to the mutable fields
    pub(crate) fn apply(&mut self, change: &TxChange) {
        match change {
            TxChange::Created { snapshot } => {
                let history = std::mem::take(&mut self.history);
                *self = (**snapshot).clone();
                self.history = history;
            }
            TxChange::Status { lifecycle } => self.lifecycle = lifecycle.clone(),
            TxChange::Params { params } => self.params = params.clone(),
            TxChange::RetryCount { retry_count } => self.retry_count = *retry_count,
            TxChange::LoadingDefaults { loading_defaults } => {
                self.loading_defaults = *loading_defaults
            }
        }
    }

    /// Apply a change and record it in the history
    pub(crate) fn record(&mut self, change: TxChange, note: impl Into<String>) {
        self.apply(&change);
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            note: note.into(),
            change,
        });
    }
}

/// Rebuild a record from its history
///
/// Returns `None` when the history does not start with a creation snapshot.
pub fn replay_history(history: &[HistoryEntry]) -> Option<TxMeta> {
    let (first, rest) = history.split_first()?;
    let mut meta = match &first.change {
        TxChange::Created { snapshot } => (**snapshot).clone(),
        _ => return None,
    };
    for entry in rest {
        meta.apply(&entry.change);
    }
    meta.history = history.to_vec();
    Some(meta)
}
