//! CLI command implementations

pub mod account;
pub mod config;
pub mod txs;
