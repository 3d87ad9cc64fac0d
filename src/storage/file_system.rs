//! File system operations for snapshot persistence
//!
//! Pretty-printed JSON files under the data directory.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::tx_storage::StorageError;

/// File name of the reconciler snapshot
pub const RECONCILER_SNAPSHOT_FILE: &str = "accounts.json";

/// Save a value as JSON, creating parent directories
///
/// Writes to a temporary file first so readers never see a partial file.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Load a JSON value; `None` when the file does not exist
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }

    let json = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&json)?))
}
