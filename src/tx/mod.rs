//! Transaction lifecycle layer
//!
//! Records, state machine, pending tracker, builder and the controller that
//! ties them to the account layer.

pub mod builder;
pub mod controller;
pub mod meta;
pub mod pending_tracker;
pub mod state_manager;

pub use builder::{
    build_base_send, build_token_send, estimate_fee, BuildError, FeePolicy, TxOutputSpec,
    UnsignedTransaction,
};
pub use controller::{ControllerError, TransactionController};
pub use meta::{
    replay_history, ErrorKind, HistoryEntry, TokenTransfer, TxChange, TxFailure, TxId,
    TxLifecycle, TxMeta, TxParams, TxStatus, TxType,
};
pub use pending_tracker::{Clock, ManualClock, PendingTxTracker, SystemClock, TrackerEvent};
pub use state_manager::{
    BootRecovery, TxEvent, TxQuery, TxStateError, TxStateManager, APPROVED_AT_BOOT_MESSAGE,
};
