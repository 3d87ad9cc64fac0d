//! Token payload encoding
//!
//! Builds canonical payloads: every field is a data push, integers are
//! 8-byte big-endian except the token type, decimals and baton vout which are
//! single bytes.

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, PushBytesBuf};

use super::codec::ScriptError;
use super::{LOKAD_ID, MAX_DECIMALS, MAX_SEND_OUTPUTS, TOKEN_TYPE_FUNGIBLE};
use crate::types::TokenOperation;

/// Parameters for a GENESIS payload
#[derive(Debug, Clone, Default)]
pub struct GenesisParams {
    pub ticker: String,
    pub name: String,
    pub document_url: String,
    /// 32-byte document hash, hex encoded
    pub document_hash: Option<String>,
    pub decimals: u8,
    pub mint_baton_vout: Option<u32>,
    pub initial_quantity: u64,
}

fn push(builder: Builder, bytes: Vec<u8>) -> Result<Builder, ScriptError> {
    let data = PushBytesBuf::try_from(bytes)
        .map_err(|e| ScriptError::Malformed(format!("push too large: {}", e)))?;
    Ok(builder.push_slice(data))
}

fn header(operation: TokenOperation) -> Result<Builder, ScriptError> {
    let builder = Builder::new().push_opcode(OP_RETURN);
    let builder = push(builder, LOKAD_ID.to_vec())?;
    let builder = push(builder, vec![TOKEN_TYPE_FUNGIBLE as u8])?;
    push(builder, operation.tag().as_bytes().to_vec())
}

fn token_id_bytes(token_id: &str) -> Result<Vec<u8>, ScriptError> {
    let bytes = hex::decode(token_id)
        .map_err(|e| ScriptError::Malformed(format!("token id is not hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ScriptError::Malformed(
            "token id must be 32 bytes".to_string(),
        ));
    }
    Ok(bytes)
}

fn baton_bytes(baton_vout: Option<u32>) -> Result<Vec<u8>, ScriptError> {
    match baton_vout {
        None => Ok(Vec::new()),
        Some(vout) if (2..=0xff).contains(&vout) => Ok(vec![vout as u8]),
        Some(vout) => Err(ScriptError::Malformed(format!(
            "mint baton vout {} out of range",
            vout
        ))),
    }
}

/// Build a GENESIS payload
pub fn genesis_script(params: &GenesisParams) -> Result<Vec<u8>, ScriptError> {
    if u64::from(params.decimals) > MAX_DECIMALS {
        return Err(ScriptError::Malformed(format!(
            "decimals {} exceeds {}",
            params.decimals, MAX_DECIMALS
        )));
    }
    let document_hash = match &params.document_hash {
        Some(hash) => {
            let bytes = hex::decode(hash)
                .map_err(|e| ScriptError::Malformed(format!("document hash: {}", e)))?;
            if bytes.len() != 32 {
                return Err(ScriptError::Malformed(
                    "document hash must be 32 bytes".to_string(),
                ));
            }
            bytes
        }
        None => Vec::new(),
    };

    let builder = header(TokenOperation::Genesis)?;
    let builder = push(builder, params.ticker.as_bytes().to_vec())?;
    let builder = push(builder, params.name.as_bytes().to_vec())?;
    let builder = push(builder, params.document_url.as_bytes().to_vec())?;
    let builder = push(builder, document_hash)?;
    let builder = push(builder, vec![params.decimals])?;
    let builder = push(builder, baton_bytes(params.mint_baton_vout)?)?;
    let builder = push(builder, params.initial_quantity.to_be_bytes().to_vec())?;

    Ok(builder.into_script().into_bytes())
}

/// Build a MINT payload
pub fn mint_script(
    token_id: &str,
    mint_baton_vout: Option<u32>,
    quantity: u64,
) -> Result<Vec<u8>, ScriptError> {
    let builder = header(TokenOperation::Mint)?;
    let builder = push(builder, token_id_bytes(token_id)?)?;
    let builder = push(builder, baton_bytes(mint_baton_vout)?)?;
    let builder = push(builder, quantity.to_be_bytes().to_vec())?;

    Ok(builder.into_script().into_bytes())
}

/// Build a SEND payload; `amounts[i]` is credited to output `i + 1`
pub fn send_script(token_id: &str, amounts: &[u64]) -> Result<Vec<u8>, ScriptError> {
    if amounts.is_empty() || amounts.len() > MAX_SEND_OUTPUTS {
        return Err(ScriptError::Malformed(format!(
            "SEND must address 1..={} outputs, got {}",
            MAX_SEND_OUTPUTS,
            amounts.len()
        )));
    }

    let mut builder = header(TokenOperation::Send)?;
    builder = push(builder, token_id_bytes(token_id)?)?;
    for amount in amounts {
        builder = push(builder, amount.to_be_bytes().to_vec())?;
    }

    Ok(builder.into_script().into_bytes())
}
