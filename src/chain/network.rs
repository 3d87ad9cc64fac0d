//! REST chain source using reqwest
//!
//! Talks to a rest.bitcoin.com-style REST API for UTXOs, raw transactions,
//! broadcast and address history, and to an SLP validation endpoint for
//! DAG validity checks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    ChainSource, ChainUtxo, HistoricalOutput, HistoryIndexer, Inclusion, NetworkError,
    RawHistoricalTx, TokenValidationOracle, TokenValidity,
};
use crate::config::NetworkType;
use crate::types::OutPoint;

/// REST client wrapper for chain queries
///
/// Provides the chain source, validation oracle and history indexer contracts
/// over HTTP. Configured with network-specific endpoints.
pub struct RestClient {
    client: reqwest::Client,

    network: NetworkType,

    /// REST API base URL
    url: String,

    /// Token validation endpoint base URL
    validator_url: String,
}

#[derive(Debug, Deserialize)]
struct UtxoResponse {
    utxos: Vec<UtxoEntry>,
}

#[derive(Debug, Deserialize)]
struct UtxoEntry {
    txid: String,
    vout: u32,
    satoshis: u64,
}

#[derive(Debug, Deserialize)]
struct RawTxResponse {
    txid: String,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    blockheight: Option<i64>,
    #[serde(default)]
    vin: Vec<RawTxInput>,
    vout: Vec<RawTxOutput>,
}

#[derive(Debug, Deserialize)]
struct RawTxInput {
    #[serde(default, rename = "cashAddress")]
    cash_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTxOutput {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    hex: String,
    #[serde(default, rename = "cashAddrs")]
    cash_addrs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddressTransactionsResponse {
    #[serde(default)]
    txs: Vec<RawTxResponse>,
}

#[derive(Debug, Serialize)]
struct HexesRequest<'a> {
    hexes: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct TxidsRequest<'a> {
    txids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ValidityEntry {
    txid: String,
    valid: bool,
}

fn map_reqwest(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else if e.is_connect() {
        NetworkError::Unavailable
    } else {
        NetworkError::Request(e.to_string())
    }
}

/// Convert a BCH-denominated JSON value to satoshis
fn value_to_sats(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|bch| (bch * 100_000_000.0).round() as u64)
            .unwrap_or(0),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map(|bch| (bch * 100_000_000.0).round() as u64)
            .unwrap_or(0),
        _ => 0,
    }
}

impl RestClient {
    /// Create a new REST client
    ///
    /// # Arguments
    ///
    /// * `url` - REST API base URL (e.g., "https://rest.bitcoin.com/v2")
    /// * `validator_url` - Token validation endpoint base URL
    /// * `network` - Network type
    /// * `timeout` - Per-request timeout
    pub fn new(
        url: &str,
        validator_url: &str,
        network: NetworkType,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Request(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            network,
            url: url.trim_end_matches('/').to_string(),
            validator_url: validator_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Option<RawTxResponse>, NetworkError> {
        let url = format!(
            "{}/rawtransactions/getRawTransaction/{}?verbose=true",
            self.url, txid
        );
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("No such mempool or blockchain transaction") {
                return Ok(None);
            }
            return Err(NetworkError::Request(format!(
                "getRawTransaction {} returned {}: {}",
                txid, status, body
            )));
        }

        response
            .json::<RawTxResponse>()
            .await
            .map(Some)
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ChainSource for RestClient {
    async fn fetch_utxos(&self, address: &str) -> Result<Vec<ChainUtxo>, NetworkError> {
        let url = format!("{}/address/utxo/{}", self.url, address);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(NetworkError::Request(format!(
                "utxo query for {} returned {}",
                address,
                response.status()
            )));
        }
        let body: UtxoResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;

        Ok(body
            .utxos
            .into_iter()
            .map(|u| ChainUtxo {
                outpoint: OutPoint::new(u.txid, u.vout),
                amount: u.satoshis,
            })
            .collect())
    }

    async fn fetch_transaction(&self, txid: &str) -> Result<Vec<Vec<u8>>, NetworkError> {
        let tx = self
            .get_raw_transaction(txid)
            .await?
            .ok_or_else(|| NetworkError::InvalidResponse(format!("unknown transaction {}", txid)))?;

        tx.vout
            .iter()
            .map(|out| {
                hex::decode(&out.script_pub_key.hex)
                    .map_err(|e| NetworkError::InvalidResponse(format!("script hex: {}", e)))
            })
            .collect()
    }

    async fn broadcast_raw_transaction(&self, raw_hex: &str) -> Result<String, NetworkError> {
        let url = format!("{}/rawtransactions/sendRawTransaction", self.url);
        let response = self
            .client
            .post(&url)
            .json(&HexesRequest { hexes: [raw_hex] })
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(NetworkError::Rejected(body));
        }
        if !status.is_success() {
            return Err(NetworkError::Request(format!("broadcast returned {}", status)));
        }

        let txids: Vec<String> = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;
        txids
            .into_iter()
            .next()
            .ok_or_else(|| NetworkError::InvalidResponse("empty broadcast response".to_string()))
    }

    async fn transaction_status(&self, txid: &str) -> Result<Inclusion, NetworkError> {
        match self.get_raw_transaction(txid).await? {
            None => Ok(Inclusion::NotFound),
            Some(tx) if tx.confirmations > 0 => Ok(Inclusion::Confirmed {
                block_height: tx.blockheight.unwrap_or_default().max(0) as u32,
            }),
            Some(_) => Ok(Inclusion::Pending),
        }
    }
}

#[async_trait]
impl TokenValidationOracle for RestClient {
    async fn validate_token_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<TokenValidity>, NetworkError> {
        let url = format!("{}/slp/validateTxid", self.validator_url);
        let response = self
            .client
            .post(&url)
            .json(&TxidsRequest { txids })
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(NetworkError::Request(format!(
                "validateTxid returned {}",
                response.status()
            )));
        }

        let entries: Vec<ValidityEntry> = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| TokenValidity {
                txid: e.txid,
                valid: e.valid,
            })
            .collect())
    }
}

#[async_trait]
impl HistoryIndexer for RestClient {
    async fn fetch_historical_transactions(
        &self,
        address: &str,
        since_block: u32,
    ) -> Result<Vec<RawHistoricalTx>, NetworkError> {
        let url = format!("{}/address/transactions/{}", self.url, address);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(NetworkError::Request(format!(
                "history query for {} returned {}",
                address,
                response.status()
            )));
        }
        let body: AddressTransactionsResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;

        Ok(body
            .txs
            .into_iter()
            .filter_map(|tx| {
                let block_height = tx.blockheight.filter(|h| *h > 0).map(|h| h as u32);
                if block_height.map(|h| h < since_block).unwrap_or(false) {
                    return None;
                }
                Some(RawHistoricalTx {
                    txid: tx.txid,
                    block_height,
                    input_addresses: tx.vin.into_iter().filter_map(|i| i.cash_address).collect(),
                    outputs: tx
                        .vout
                        .iter()
                        .map(|out| HistoricalOutput {
                            address: out
                                .script_pub_key
                                .cash_addrs
                                .first()
                                .cloned()
                                .unwrap_or_default(),
                            amount: value_to_sats(&out.value),
                        })
                        .collect(),
                    output_scripts: tx
                        .vout
                        .into_iter()
                        .map(|out| out.script_pub_key.hex)
                        .collect(),
                })
            })
            .collect())
    }
}

/// Get default REST API URL for a given network
pub fn default_rest_url(network: NetworkType) -> String {
    match network {
        NetworkType::Mainnet => "https://rest.bitcoin.com/v2".to_string(),
        NetworkType::Testnet => "https://trest.bitcoin.com/v2".to_string(),
        NetworkType::Regtest => "http://localhost:3000/v2".to_string(),
    }
}

/// Get default token validation URL for a given network
pub fn default_validator_url(network: NetworkType) -> String {
    match network {
        NetworkType::Mainnet => "https://rest.bitcoin.com/v2".to_string(),
        NetworkType::Testnet => "https://trest.bitcoin.com/v2".to_string(),
        NetworkType::Regtest => "http://localhost:3000/v2".to_string(),
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("network", &self.network)
            .field("url", &self.url)
            .field("validator_url", &self.validator_url)
            .finish()
    }
}
