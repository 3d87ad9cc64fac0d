//! SLP Wallet Backend
//!
//! Single-signer wallet backend for a UTXO ledger with an OP_RETURN token
//! overlay: reconciles UTXOs and token balances for tracked addresses and
//! drives outgoing transactions from creation to confirmation.

pub mod account;
pub mod chain;
pub mod cli;
pub mod config;
pub mod script;
pub mod storage;
pub mod tx;
pub mod types;
