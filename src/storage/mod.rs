//! Storage layer for wallet data
//!
//! SQLite-backed transaction records and JSON snapshots of reconciled accounts.

pub mod file_system;
pub mod tx_storage;

pub use tx_storage::{StorageError, TxStorage};
