//! SLP token script codec
//!
//! Decodes and encodes the OP_RETURN payload carrying token GENESIS, MINT and
//! SEND operations. Pure functions over script bytes.

pub mod builder;
pub mod codec;

pub use builder::{genesis_script, mint_script, send_script, GenesisParams};
pub use codec::{decode_genesis, decode_output_script, GenesisInfo, ScriptError};

/// Lokad identifier of the token protocol ("SLP\0")
pub const LOKAD_ID: [u8; 4] = *b"SLP\0";

/// The only token type understood by this codec
pub const TOKEN_TYPE_FUNGIBLE: u64 = 1;

/// Maximum number of token outputs a SEND may address
pub const MAX_SEND_OUTPUTS: usize = 19;

/// Maximum decimals allowed by the protocol
pub const MAX_DECIMALS: u64 = 9;
