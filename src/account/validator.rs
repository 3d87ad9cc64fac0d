//! Token DAG validation
//!
//! Batches candidate token transaction ids into fixed-size requests to the
//! validation oracle. A failure of any request fails the whole batch, so no
//! verdict from a partially answered batch is ever trusted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{timed, NetworkError, TokenValidationOracle};

/// Errors that can occur during validation
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("Validation oracle error: {0}")]
    Network(#[from] NetworkError),
}

pub struct TokenValidator {
    oracle: Arc<dyn TokenValidationOracle>,
    batch_size: usize,
    timeout: Duration,
}

impl TokenValidator {
    pub fn new(oracle: Arc<dyn TokenValidationOracle>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            oracle,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    /// Validity verdicts keyed by txid
    ///
    /// Ids the oracle did not answer for are absent from the map. Verdicts for
    /// ids that were not asked about are ignored.
    pub async fn validate(&self, txids: &[String]) -> Result<HashMap<String, bool>, ValidatorError> {
        let mut verdicts = HashMap::with_capacity(txids.len());
        if txids.is_empty() {
            return Ok(verdicts);
        }

        for chunk in txids.chunks(self.batch_size) {
            let answers = timed(self.timeout, self.oracle.validate_token_txids(chunk)).await?;
            for answer in answers {
                if chunk.contains(&answer.txid) {
                    verdicts.insert(answer.txid, answer.valid);
                }
            }
        }

        log::debug!(
            "✓ Validated {} token transactions in {} requests",
            verdicts.len(),
            txids.len().div_ceil(self.batch_size)
        );

        Ok(verdicts)
    }
}
