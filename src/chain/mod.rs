//! External collaborators
//!
//! Contracts for the chain data source, token validation oracle, signer and
//! history indexer. Every call made through these traits is wrapped in
//! [`timed`] so a slow collaborator surfaces as a transient error.

pub mod network;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tx::builder::UnsignedTransaction;
use crate::types::OutPoint;

pub use network::{default_rest_url, default_validator_url, RestClient};

/// Errors that can occur while talking to a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Network request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Network unavailable")]
    Unavailable,

    /// The remote side explicitly refused the request (e.g. broadcast rejected)
    #[error("Rejected by chain: {0}")]
    Rejected(String),
}

impl NetworkError {
    /// Transient errors may be retried; rejections are authoritative
    pub fn is_transient(&self) -> bool {
        !matches!(self, NetworkError::Rejected(_))
    }
}

/// An unspent output as reported by the chain source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUtxo {
    pub outpoint: OutPoint,
    pub amount: u64,
}

/// Inclusion state of a broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inclusion {
    Confirmed { block_height: u32 },
    Pending,
    Invalid { reason: String },
    NotFound,
}

/// Validity verdict for one token transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidity {
    pub txid: String,
    pub valid: bool,
}

/// Transaction output as seen by the history indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalOutput {
    pub address: String,
    pub amount: u64,
}

/// Transaction touching a tracked address, as reported by the history indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHistoricalTx {
    pub txid: String,
    pub block_height: Option<u32>,
    /// Addresses funding the transaction inputs
    pub input_addresses: Vec<String>,
    pub outputs: Vec<HistoricalOutput>,
    /// Raw output scripts, index aligned with `outputs`
    #[serde(default)]
    pub output_scripts: Vec<String>,
}

/// Chain data source and broadcaster
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current unspent outputs of an address
    async fn fetch_utxos(&self, address: &str) -> Result<Vec<ChainUtxo>, NetworkError>;

    /// Raw output scripts of a transaction, index aligned with its outputs
    async fn fetch_transaction(&self, txid: &str) -> Result<Vec<Vec<u8>>, NetworkError>;

    /// Broadcast a signed raw transaction, returning its txid
    async fn broadcast_raw_transaction(&self, raw_hex: &str) -> Result<String, NetworkError>;

    /// Inclusion state of a transaction
    async fn transaction_status(&self, txid: &str) -> Result<Inclusion, NetworkError>;
}

/// DAG validation oracle for token transactions
#[async_trait]
pub trait TokenValidationOracle: Send + Sync {
    async fn validate_token_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<TokenValidity>, NetworkError>;
}

/// Opaque signer holding the wallet keys
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `tx` for `address`, returning the raw transaction hex
    async fn sign(&self, tx: &UnsignedTransaction, address: &str) -> Result<String, NetworkError>;
}

/// Indexer of historical transactions per address
#[async_trait]
pub trait HistoryIndexer: Send + Sync {
    async fn fetch_historical_transactions(
        &self,
        address: &str,
        since_block: u32,
    ) -> Result<Vec<RawHistoricalTx>, NetworkError>;
}

/// Run a collaborator call with an explicit deadline
///
/// An elapsed deadline is reported as `NetworkError::Timeout`, never as a
/// rejection.
pub async fn timed<T, F>(timeout: Duration, call: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout),
    }
}
