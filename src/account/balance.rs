//! Balance aggregation
//!
//! Pure projection of a UTXO set and token metadata into [`AccountBalances`].

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::{AccountBalances, TokenMetadata, Utxo};

/// Scale a raw token quantity by the token's decimals
///
/// Returns `None` when the quantity does not fit a decimal.
pub fn to_display_amount(quantity: u64, decimals: u8) -> Option<Decimal> {
    Decimal::try_from_i128_with_scale(quantity as i128, decimals as u32).ok()
}

/// Convert a display amount back to raw base units
///
/// Fails when the amount is negative or carries more precision than `decimals`.
pub fn to_raw_amount(amount: Decimal, decimals: u8) -> Option<u64> {
    if amount.is_sign_negative() {
        return None;
    }
    let scaled = amount.checked_mul(Decimal::from(10u64.checked_pow(decimals as u32)?))?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.trunc().to_u64()
}

/// Aggregate spendable balances
///
/// Base currency is the sum over spendable outputs without a token payload. A token balance is the
/// sum over valid, non-baton outputs of that token, scaled by its decimals;
/// tokens without metadata are left out.
pub fn aggregate<'a, I>(utxos: I, metadata: &HashMap<String, TokenMetadata>) -> AccountBalances
where
    I: IntoIterator<Item = &'a Utxo>,
{
    let mut balances = AccountBalances::default();
    let mut raw: HashMap<&str, u128> = HashMap::new();

    for utxo in utxos {
        if utxo.spendable && !utxo.quarantined && !utxo.is_token() {
            balances.base_currency_available =
                balances.base_currency_available.saturating_add(utxo.amount);
        }
        if utxo.holds_valid_tokens() {
            if let Some(info) = &utxo.token_info {
                *raw.entry(info.token_id.as_str()).or_default() += info.quantity as u128;
            }
        }
    }

    for (token_id, quantity) in raw {
        let meta = match metadata.get(token_id) {
            Some(meta) => meta,
            None => continue,
        };
        match i128::try_from(quantity)
            .ok()
            .and_then(|q| Decimal::try_from_i128_with_scale(q, meta.decimals as u32).ok())
        {
            Some(amount) => {
                balances.per_token.insert(token_id.to_string(), amount);
            }
            None => log::warn!("Token balance of {} overflows", token_id),
        }
    }

    balances
}
