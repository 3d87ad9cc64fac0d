//! Unsigned transaction construction
//!
//! Coin selection and fee estimation for base-currency and token sends. The
//! result is an [`UnsignedTransaction`] handed to the external signer.

use serde::{Deserialize, Serialize};

use crate::script::{send_script, ScriptError};
use crate::types::{OutPoint, Utxo};

/// Serialized size of a transaction without inputs or outputs
const TX_OVERHEAD_BYTES: u64 = 10;
/// P2PKH input with signature and compressed pubkey
const INPUT_BYTES: u64 = 148;
/// P2PKH output
const OUTPUT_BYTES: u64 = 34;
/// Value and script length prefix of a data output
const DATA_OUTPUT_OVERHEAD: u64 = 9;

/// Errors that can occur while building a transaction
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Insufficient tokens of {token_id}: need {needed}, have {available}")]
    InsufficientTokens {
        token_id: String,
        needed: u64,
        available: u64,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Token script error: {0}")]
    Script(#[from] ScriptError),
}

/// Fee and dust settings used during coin selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    /// Satoshis per byte
    pub fee_rate: u64,
    /// Smallest output worth creating
    pub dust_limit: u64,
}

/// One output of an unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxOutputSpec {
    /// Pay `amount` satoshis to `address`
    Payment { address: String, amount: u64 },
    /// Zero-value OP_RETURN output
    Data {
        #[serde(with = "hex_bytes")]
        script: Vec<u8>,
    },
}

impl TxOutputSpec {
    pub fn payment(address: impl Into<String>, amount: u64) -> Self {
        TxOutputSpec::Payment {
            address: address.into(),
            amount,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            TxOutputSpec::Payment { amount, .. } => *amount,
            TxOutputSpec::Data { .. } => 0,
        }
    }
}

/// Transaction ready for signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<TxOutputSpec>,
    /// Fee in satoshis (inputs minus outputs)
    pub fee: u64,
}

impl UnsignedTransaction {
    pub fn input_outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|u| u.outpoint.clone()).collect()
    }

    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|u| u.amount).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(TxOutputSpec::amount).sum()
    }

    /// Sum of outputs paying `address`
    pub fn paid_to(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                TxOutputSpec::Payment { address: a, amount } if a == address => Some(*amount),
                _ => None,
            })
            .sum()
    }
}

/// Estimated fee for a transaction of the given shape
///
/// `outputs` counts payment outputs only; a data output is sized from its
/// script length. Returns `None` when the fee does not fit in a `u64`.
pub fn estimate_fee(
    inputs: usize,
    outputs: usize,
    op_return_len: Option<usize>,
    fee_rate: u64,
) -> Option<u64> {
    let mut bytes = INPUT_BYTES
        .checked_mul(inputs as u64)?
        .checked_add(OUTPUT_BYTES.checked_mul(outputs as u64)?)?
        .checked_add(TX_OVERHEAD_BYTES)?;
    if let Some(len) = op_return_len {
        bytes = bytes
            .checked_add(DATA_OUTPUT_OVERHEAD)?
            .checked_add(len as u64)?;
    }
    bytes.checked_mul(fee_rate)
}

fn overflow(what: &str) -> BuildError {
    BuildError::InvalidAmount(format!("{} exceeds the representable amount", what))
}

/// Largest outputs first, ties broken by outpoint for determinism
fn by_amount_desc(candidates: &[Utxo]) -> Vec<Utxo> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.outpoint.cmp(&b.outpoint)));
    sorted
}

/// Add base-currency inputs until `outputs` and the fee are covered
///
/// A change output back to `change_address` is added when the remainder is
/// at least the dust limit; otherwise the remainder goes to the fee.
fn fund(
    mut inputs: Vec<Utxo>,
    mut outputs: Vec<TxOutputSpec>,
    candidates: &[Utxo],
    change_address: &str,
    policy: FeePolicy,
) -> Result<UnsignedTransaction, BuildError> {
    let op_return_len = outputs.iter().find_map(|o| match o {
        TxOutputSpec::Data { script } => Some(script.len()),
        _ => None,
    });
    let payment_count = outputs
        .iter()
        .filter(|o| matches!(o, TxOutputSpec::Payment { .. }))
        .count();
    let target = outputs
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.amount()))
        .ok_or_else(|| overflow("Output total"))?;

    let pool: Vec<Utxo> = by_amount_desc(candidates)
        .into_iter()
        .filter(|c| !inputs.iter().any(|i| i.outpoint == c.outpoint))
        .collect();
    let mut pool = pool.into_iter();
    let mut total_in = inputs
        .iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.amount))
        .ok_or_else(|| overflow("Input total"))?;

    loop {
        let fee_without_change =
            estimate_fee(inputs.len(), payment_count, op_return_len, policy.fee_rate)
                .ok_or_else(|| overflow("Fee"))?;
        let needed = target
            .checked_add(fee_without_change)
            .ok_or_else(|| overflow("Amount plus fee"))?;

        if total_in >= needed {
            let surplus = total_in - target;
            let with_change =
                estimate_fee(inputs.len(), payment_count + 1, op_return_len, policy.fee_rate)
                    .and_then(|fee| surplus.checked_sub(fee).map(|change| (fee, change)));
            let fee = match with_change {
                Some((fee_with_change, change)) if change >= policy.dust_limit => {
                    outputs.push(TxOutputSpec::payment(change_address, change));
                    fee_with_change
                }
                _ => surplus,
            };

            log::debug!(
                "✓ Selected {} inputs ({} sats) for {} sats, fee {}",
                inputs.len(),
                total_in,
                target,
                fee
            );

            return Ok(UnsignedTransaction {
                inputs,
                outputs,
                fee,
            });
        }

        match pool.next() {
            Some(utxo) => {
                total_in = total_in
                    .checked_add(utxo.amount)
                    .ok_or_else(|| overflow("Input total"))?;
                inputs.push(utxo);
            }
            None => {
                return Err(BuildError::InsufficientFunds {
                    needed,
                    available: total_in,
                })
            }
        }
    }
}

/// Build a base-currency payment of `value` satoshis from `from` to `to`
///
/// # Arguments
///
/// * `candidates` - Spendable outputs of `from`
/// * `policy` - Fee rate and dust limit
pub fn build_base_send(
    candidates: &[Utxo],
    from: &str,
    to: &str,
    value: u64,
    policy: FeePolicy,
) -> Result<UnsignedTransaction, BuildError> {
    if value < policy.dust_limit {
        return Err(BuildError::InvalidAmount(format!(
            "{} sats is below the dust limit of {}",
            value, policy.dust_limit
        )));
    }

    fund(
        Vec::new(),
        vec![TxOutputSpec::payment(to, value)],
        candidates,
        from,
        policy,
    )
}

/// Build a token transfer of `raw_amount` base units
///
/// Output layout is the SEND data output, a dust output to the recipient,
/// a dust output carrying the token change (when any) and the base change.
///
/// # Arguments
///
/// * `token_candidates` - Valid, non-baton outputs of the token owned by `from`
/// * `base_candidates` - Spendable base-currency outputs of `from`
pub fn build_token_send(
    token_candidates: &[Utxo],
    base_candidates: &[Utxo],
    from: &str,
    to: &str,
    token_id: &str,
    raw_amount: u64,
    policy: FeePolicy,
) -> Result<UnsignedTransaction, BuildError> {
    if raw_amount == 0 {
        return Err(BuildError::InvalidAmount(
            "Token amount must be greater than zero".to_string(),
        ));
    }

    let quantity = |u: &Utxo| u.token_info.as_ref().map(|t| t.quantity).unwrap_or(0);

    let mut sorted = token_candidates.to_vec();
    sorted.sort_by(|a, b| quantity(b).cmp(&quantity(a)).then(a.outpoint.cmp(&b.outpoint)));

    let mut token_inputs = Vec::new();
    let mut selected: u64 = 0;
    for utxo in sorted {
        if selected >= raw_amount {
            break;
        }
        selected = selected.saturating_add(quantity(&utxo));
        token_inputs.push(utxo);
    }

    if selected < raw_amount {
        return Err(BuildError::InsufficientTokens {
            token_id: token_id.to_string(),
            needed: raw_amount,
            available: selected,
        });
    }

    let token_change = selected - raw_amount;
    let mut amounts = vec![raw_amount];
    if token_change > 0 {
        amounts.push(token_change);
    }

    let script = send_script(token_id, &amounts)?;
    let mut outputs = vec![
        TxOutputSpec::Data { script },
        TxOutputSpec::payment(to, policy.dust_limit),
    ];
    if token_change > 0 {
        outputs.push(TxOutputSpec::payment(from, policy.dust_limit));
    }

    fund(token_inputs, outputs, base_candidates, from, policy)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
