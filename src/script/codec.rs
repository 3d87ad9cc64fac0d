//! Token payload decoding
//!
//! Chunk layout of a token payload:
//!
//! | chunk | GENESIS         | MINT             | SEND              |
//! |-------|-----------------|------------------|-------------------|
//! | 0     | OP_RETURN       | OP_RETURN        | OP_RETURN         |
//! | 1     | `SLP\0`         | `SLP\0`          | `SLP\0`           |
//! | 2     | token type      | token type       | token type        |
//! | 3     | `GENESIS`       | `MINT`           | `SEND`            |
//! | 4     | ticker          | token id         | token id          |
//! | 5     | name            | baton vout       | amount, output 1  |
//! | 6     | document url    | quantity         | amount, output 2  |
//! | 7     | document hash   |                  | ...               |
//! | 8     | decimals        |                  |                   |
//! | 9     | baton vout      |                  |                   |
//! | 10    | quantity        |                  |                   |
//!
//! Integer fields show up either as big-endian pushes or, for 1..=16, as
//! `OP_1`..`OP_16`; both normalise to the same value.

use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RETURN};
use bitcoin::script::{Instruction, Script};
use serde::{Deserialize, Serialize};

use super::{LOKAD_ID, MAX_DECIMALS, MAX_SEND_OUTPUTS, TOKEN_TYPE_FUNGIBLE};
use crate::types::{TokenOperation, TokenOutputInfo};

/// Errors that can occur while decoding a token payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// The output is an ordinary output; callers treat this as a classification
    #[error("Not a token output")]
    NotATokenOutput,

    #[error("Unknown token operation: {0}")]
    UnknownOperation(String),

    #[error("Malformed token script: {0}")]
    Malformed(String),
}

impl ScriptError {
    /// Whether the error is a protocol decode failure (as opposed to "ordinary output")
    pub fn is_decode_failure(&self) -> bool {
        !matches!(self, ScriptError::NotATokenOutput)
    }
}

/// Full GENESIS record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisInfo {
    pub ticker: String,
    pub name: String,
    pub document_url: String,
    pub document_hash: Option<String>,
    pub decimals: u8,
    pub mint_baton_vout: Option<u32>,
    pub initial_quantity: u64,
}

/// A single parsed chunk
#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Push(Vec<u8>),
    Op(u8),
}

impl Chunk {
    /// Normalise a push or small-integer opcode to an integer
    fn as_u64(&self) -> Option<u64> {
        match self {
            Chunk::Push(bytes) if bytes.len() <= 8 => Some(
                bytes
                    .iter()
                    .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            ),
            Chunk::Op(op) if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(op) => {
                Some(u64::from(op - OP_PUSHNUM_1.to_u8() + 1))
            }
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Push(bytes) => Some(bytes),
            Chunk::Op(_) => None,
        }
    }
}

/// Split a script into chunks; `None` if the script does not parse
fn chunks(script_bytes: &[u8]) -> Option<Vec<Chunk>> {
    Script::from_bytes(script_bytes)
        .instructions()
        .map(|ins| {
            ins.ok().map(|ins| match ins {
                Instruction::PushBytes(bytes) => Chunk::Push(bytes.as_bytes().to_vec()),
                Instruction::Op(op) => Chunk::Op(op.to_u8()),
            })
        })
        .collect()
}

/// Check the fixed header and return the chunks plus the operation
fn parse_header(script_bytes: &[u8]) -> Result<(Vec<Chunk>, TokenOperation), ScriptError> {
    let chunks = chunks(script_bytes).ok_or(ScriptError::NotATokenOutput)?;

    if chunks.first() != Some(&Chunk::Op(OP_RETURN.to_u8())) {
        return Err(ScriptError::NotATokenOutput);
    }
    match chunks.get(1).and_then(Chunk::as_bytes) {
        Some(lokad) if lokad == LOKAD_ID => {}
        _ => return Err(ScriptError::NotATokenOutput),
    }
    match chunks.get(2).and_then(Chunk::as_u64) {
        Some(TOKEN_TYPE_FUNGIBLE) => {}
        _ => return Err(ScriptError::NotATokenOutput),
    }

    let tag = chunks
        .get(3)
        .and_then(Chunk::as_bytes)
        .ok_or_else(|| ScriptError::Malformed("missing transaction type".to_string()))?;
    let operation = match tag {
        b"GENESIS" => TokenOperation::Genesis,
        b"MINT" => TokenOperation::Mint,
        b"SEND" => TokenOperation::Send,
        other => {
            return Err(ScriptError::UnknownOperation(
                String::from_utf8_lossy(other).into_owned(),
            ))
        }
    };

    Ok((chunks, operation))
}

fn field<'a>(chunks: &'a [Chunk], index: usize, name: &str) -> Result<&'a Chunk, ScriptError> {
    chunks
        .get(index)
        .ok_or_else(|| ScriptError::Malformed(format!("missing {} field", name)))
}

fn int_field(chunks: &[Chunk], index: usize, name: &str) -> Result<u64, ScriptError> {
    field(chunks, index, name)?
        .as_u64()
        .ok_or_else(|| ScriptError::Malformed(format!("{} is not an integer", name)))
}

fn text_field(chunks: &[Chunk], index: usize, name: &str) -> Result<String, ScriptError> {
    let bytes = field(chunks, index, name)?
        .as_bytes()
        .ok_or_else(|| ScriptError::Malformed(format!("{} is not a data push", name)))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn token_id_field(chunks: &[Chunk]) -> Result<String, ScriptError> {
    match field(chunks, 4, "token id")?.as_bytes() {
        Some(bytes) if bytes.len() == 32 => Ok(hex::encode(bytes)),
        _ => Err(ScriptError::Malformed(
            "token id must be a 32-byte push".to_string(),
        )),
    }
}

/// Baton vout: empty push means "no baton"
fn baton_field(chunks: &[Chunk], index: usize) -> Result<Option<u32>, ScriptError> {
    let chunk = field(chunks, index, "mint baton vout")?;
    if chunk == &Chunk::Push(Vec::new()) {
        return Ok(None);
    }
    let vout = chunk
        .as_u64()
        .ok_or_else(|| ScriptError::Malformed("mint baton vout is not an integer".to_string()))?;
    if !(2..=0xff).contains(&vout) {
        return Err(ScriptError::Malformed(format!(
            "mint baton vout {} out of range",
            vout
        )));
    }
    Ok(Some(vout as u32))
}

/// Decode the full GENESIS record from a token payload
pub fn decode_genesis(script_bytes: &[u8]) -> Result<GenesisInfo, ScriptError> {
    let (chunks, operation) = parse_header(script_bytes)?;
    if operation != TokenOperation::Genesis {
        return Err(ScriptError::Malformed(format!(
            "expected GENESIS, found {}",
            operation
        )));
    }

    let decimals = int_field(&chunks, 8, "decimals")?;
    if decimals > MAX_DECIMALS {
        return Err(ScriptError::Malformed(format!(
            "decimals {} exceeds {}",
            decimals, MAX_DECIMALS
        )));
    }

    let document_hash = match field(&chunks, 7, "document hash")?.as_bytes() {
        Some([]) => None,
        Some(bytes) if bytes.len() == 32 => Some(hex::encode(bytes)),
        _ => {
            return Err(ScriptError::Malformed(
                "document hash must be empty or 32 bytes".to_string(),
            ))
        }
    };

    Ok(GenesisInfo {
        ticker: text_field(&chunks, 4, "ticker")?,
        name: text_field(&chunks, 5, "name")?,
        document_url: text_field(&chunks, 6, "document url")?,
        document_hash,
        decimals: decimals as u8,
        mint_baton_vout: baton_field(&chunks, 9)?,
        initial_quantity: int_field(&chunks, 10, "initial quantity")?,
    })
}

/// Classify output `output_index` of the transaction whose payload is `script_bytes`
///
/// `txid` is the id of that transaction; it becomes the token id of GENESIS outputs.
/// Returns `ScriptError::NotATokenOutput` for outputs the payload does not address.
pub fn decode_output_script(
    script_bytes: &[u8],
    txid: &str,
    output_index: u32,
) -> Result<TokenOutputInfo, ScriptError> {
    let (chunks, operation) = parse_header(script_bytes)?;

    if output_index == 0 {
        return Err(ScriptError::NotATokenOutput);
    }

    match operation {
        TokenOperation::Genesis => {
            let genesis = decode_genesis(script_bytes)?;
            issuance_output(
                txid.to_string(),
                operation,
                genesis.mint_baton_vout,
                genesis.initial_quantity,
                output_index,
            )
        }
        TokenOperation::Mint => {
            let token_id = token_id_field(&chunks)?;
            let baton = baton_field(&chunks, 5)?;
            let quantity = int_field(&chunks, 6, "additional quantity")?;
            issuance_output(token_id, operation, baton, quantity, output_index)
        }
        TokenOperation::Send => {
            let token_id = token_id_field(&chunks)?;
            let amount_count = chunks.len().saturating_sub(5);
            if amount_count == 0 || amount_count > MAX_SEND_OUTPUTS {
                return Err(ScriptError::Malformed(format!(
                    "SEND carries {} amounts",
                    amount_count
                )));
            }
            let chunk = chunks
                .get(4 + output_index as usize)
                .ok_or(ScriptError::NotATokenOutput)?;
            let quantity = chunk
                .as_u64()
                .ok_or_else(|| ScriptError::Malformed("amount is not an integer".to_string()))?;
            Ok(TokenOutputInfo {
                token_id,
                operation,
                quantity,
                is_mint_baton: false,
            })
        }
    }
}

/// GENESIS and MINT credit output 1 and place the baton at its vout
fn issuance_output(
    token_id: String,
    operation: TokenOperation,
    baton_vout: Option<u32>,
    quantity: u64,
    output_index: u32,
) -> Result<TokenOutputInfo, ScriptError> {
    if output_index == 1 {
        Ok(TokenOutputInfo {
            token_id,
            operation,
            quantity,
            is_mint_baton: false,
        })
    } else if baton_vout == Some(output_index) {
        Ok(TokenOutputInfo {
            token_id,
            operation,
            quantity: 0,
            is_mint_baton: true,
        })
    } else {
        Err(ScriptError::NotATokenOutput)
    }
}
