//! Per-address UTXO cache
//!
//! Holds every known output of one address together with its token
//! classification and validity. Refreshing against a new fetch happens in two
//! steps: [`UtxoCache::diff`] drops stale entries and reports which fetched
//! outputs still need classification, then [`classify`] turns each of those
//! into a cached [`Utxo`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::chain::ChainUtxo;
use crate::script::{decode_output_script, ScriptError};
use crate::types::{OutPoint, Utxo};

/// Result of diffing the cache against a fresh fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDiff {
    /// Entries no longer reported by the chain source
    pub spent: Vec<Utxo>,
    /// Token entries still awaiting validation, dropped for re-evaluation
    pub stale: Vec<Utxo>,
    /// Fetched outputs absent from the cache after the diff
    pub unseen: Vec<ChainUtxo>,
}

/// Serialized as a list of outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Utxo>", into = "Vec<Utxo>")]
pub struct UtxoCache {
    entries: BTreeMap<OutPoint, Utxo>,
}

impl From<Vec<Utxo>> for UtxoCache {
    fn from(utxos: Vec<Utxo>) -> Self {
        Self {
            entries: utxos
                .into_iter()
                .map(|u| (u.outpoint.clone(), u))
                .collect(),
        }
    }
}

impl From<UtxoCache> for Vec<Utxo> {
    fn from(cache: UtxoCache) -> Self {
        cache.entries.into_values().collect()
    }
}

impl UtxoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.entries.get(outpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.entries.values()
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.entries.insert(utxo.outpoint.clone(), utxo);
    }

    /// Drop spent entries and token entries not yet proven valid
    ///
    /// Everything else (ordinary outputs, validated token outputs and
    /// quarantined outputs) is kept as is.
    pub fn diff(&mut self, fetched: &[ChainUtxo]) -> CacheDiff {
        let live: HashSet<&OutPoint> = fetched.iter().map(|u| &u.outpoint).collect();
        let mut diff = CacheDiff::default();

        let outpoints: Vec<OutPoint> = self.entries.keys().cloned().collect();
        for outpoint in outpoints {
            let drop_spent = !live.contains(&outpoint);
            let drop_stale = self
                .entries
                .get(&outpoint)
                .map(Utxo::awaiting_validation)
                .unwrap_or(false);

            if !(drop_spent || drop_stale) {
                continue;
            }
            if let Some(utxo) = self.entries.remove(&outpoint) {
                if drop_spent {
                    diff.spent.push(utxo);
                } else {
                    diff.stale.push(utxo);
                }
            }
        }

        diff.unseen = fetched
            .iter()
            .filter(|u| !self.entries.contains_key(&u.outpoint))
            .cloned()
            .collect();

        diff
    }

    /// Distinct transaction ids of token outputs awaiting validation
    pub fn validation_candidates(&self) -> Vec<String> {
        let mut txids: Vec<String> = self
            .entries
            .values()
            .filter(|u| u.awaiting_validation())
            .map(|u| u.outpoint.txid.clone())
            .collect();
        txids.sort();
        txids.dedup();
        txids
    }

    /// Record a validity verdict for every token output created by `txid`
    ///
    /// Token outputs stay locked either way. Valid ones count towards token
    /// balances; invalid ones are permanently excluded from spending.
    pub fn set_validity(&mut self, txid: &str, valid: bool) {
        for utxo in self
            .entries
            .values_mut()
            .filter(|u| u.outpoint.txid == txid && u.awaiting_validation())
        {
            utxo.token_valid = Some(valid);
            utxo.spendable = false;
        }
    }

    /// Token ids referenced by cached, non-quarantined token outputs
    pub fn token_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .values()
            .filter(|u| !u.quarantined)
            .filter_map(|u| u.token_info.as_ref().map(|t| t.token_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Permanently exclude every output of `token_id`
    pub fn quarantine_token(&mut self, token_id: &str) -> usize {
        let mut count = 0;
        for utxo in self.entries.values_mut().filter(|u| {
            !u.quarantined
                && u.token_info
                    .as_ref()
                    .map(|t| t.token_id == token_id)
                    .unwrap_or(false)
        }) {
            utxo.quarantined = true;
            utxo.spendable = false;
            count += 1;
        }
        count
    }
}

/// Classify a fetched output using the output scripts of its transaction
///
/// The token payload, if any, lives in output 0. Ordinary outputs become
/// spendable; token outputs are locked pending validation; payloads that fail
/// to decode quarantine the output.
pub fn classify(address: &str, fetched: &ChainUtxo, output_scripts: &[Vec<u8>]) -> Utxo {
    let mut utxo = Utxo::unclassified(fetched.outpoint.clone(), fetched.amount, address);

    let payload = match output_scripts.first() {
        Some(script) => script,
        None => {
            utxo.spendable = true;
            return utxo;
        }
    };

    match decode_output_script(payload, &fetched.outpoint.txid, fetched.outpoint.vout) {
        Ok(info) => {
            utxo.token_info = Some(info);
        }
        Err(ScriptError::NotATokenOutput) => {
            utxo.spendable = true;
        }
        Err(e) => {
            log::warn!("Quarantining {}: {}", fetched.outpoint, e);
            utxo.quarantined = true;
        }
    }

    utxo
}
