//! Account reconciliation layer
//!
//! UTXO cache, token validation, balance aggregation and the reconciler
//! that drives them per tracked address.

pub mod balance;
pub mod observable;
pub mod reconciler;
pub mod utxo_cache;
pub mod validator;

pub use balance::{aggregate, to_display_amount, to_raw_amount};
pub use observable::ObservableStore;
pub use reconciler::{
    AccountReconciler, AccountState, IncomingToken, IncomingTransfer, ReconcileError,
    ReconcilerState, TokenMetadataEntry,
};
pub use utxo_cache::{classify, CacheDiff, UtxoCache};
pub use validator::{TokenValidator, ValidatorError};
