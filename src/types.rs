//! Shared types for slp-wallet-backend
//!
//! Common data structures used across the reconciliation and transaction layers.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Reference to a transaction output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction ID (hex)
    pub txid: String,

    /// Output index
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Token protocol operation carried by an OP_RETURN payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOperation {
    Genesis,
    Mint,
    Send,
}

impl TokenOperation {
    /// Ascii tag used in the script payload
    pub fn tag(&self) -> &'static str {
        match self {
            TokenOperation::Genesis => "GENESIS",
            TokenOperation::Mint => "MINT",
            TokenOperation::Send => "SEND",
        }
    }
}

impl std::fmt::Display for TokenOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Token information decoded for a single transaction output
///
/// Immutable once decoded. `quantity` is in the token's base units; it is
/// scaled by the token's decimals only when balances are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutputInfo {
    /// Token ID (txid of the genesis transaction)
    pub token_id: String,

    pub operation: TokenOperation,

    /// Raw quantity in base units (zero for mint batons)
    pub quantity: u64,

    /// Whether this output carries minting authority
    pub is_mint_baton: bool,
}

/// A cached unspent output owned by a tracked address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,

    /// Amount in satoshis
    pub amount: u64,

    /// Address that owns the output
    pub address: String,

    /// Whether the output may be used as a base-currency input
    pub spendable: bool,

    /// Token payload bound to this output (None for ordinary outputs)
    pub token_info: Option<TokenOutputInfo>,

    /// DAG validity verdict (None until the validator has answered)
    pub token_valid: Option<bool>,

    /// Permanently excluded from spending and balances (malformed token data)
    #[serde(default)]
    pub quarantined: bool,
}

impl Utxo {
    /// Create an unclassified output as returned by the chain source
    pub fn unclassified(outpoint: OutPoint, amount: u64, address: impl Into<String>) -> Self {
        Self {
            outpoint,
            amount,
            address: address.into(),
            spendable: false,
            token_info: None,
            token_valid: None,
            quarantined: false,
        }
    }

    pub fn is_token(&self) -> bool {
        self.token_info.is_some()
    }

    /// Token-bearing output whose validity is still unknown
    pub fn awaiting_validation(&self) -> bool {
        self.is_token() && self.token_valid.is_none() && !self.quarantined
    }

    /// Valid token output that contributes to a token balance
    pub fn holds_valid_tokens(&self) -> bool {
        !self.quarantined
            && self.token_valid == Some(true)
            && self
                .token_info
                .as_ref()
                .map(|info| !info.is_mint_baton)
                .unwrap_or(false)
    }
}

/// Genesis record of a token, cached once per token id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub token_id: String,
    pub ticker: String,
    pub name: String,
    pub decimals: u8,
}

/// Spendable balances for one address
///
/// Pure projection of the UTXO cache and token metadata; never mutated directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Spendable base currency in satoshis
    pub base_currency_available: u64,

    /// Token balances keyed by token id, scaled by decimals
    pub per_token: BTreeMap<String, Decimal>,
}

impl AccountBalances {
    pub fn token(&self, token_id: &str) -> Decimal {
        self.per_token
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}
