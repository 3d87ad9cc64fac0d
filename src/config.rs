//! Configuration types for the SLP wallet backend
//!
//! Manages global configuration including network settings, REST endpoints and
//! the wallet policy knobs (history limit, fee rate, validation batching,
//! timeouts).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::{default_rest_url, default_validator_url};

/// Global wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub chain: ChainConfig,
    #[serde(default)]
    pub wallet: WalletSettings,
    /// Optional custom data directory
    pub data_dir: Option<String>,
}

/// Chain endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub network: NetworkType,
    pub rest_url: String,
    pub validator_url: String,
}

/// Wallet policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    /// Maximum number of stored transactions per sender address
    pub tx_history_limit: usize,

    /// Fee rate in satoshis per byte
    pub fee_rate_sat_per_byte: u64,

    /// Smallest output the network relays
    pub dust_limit_sats: u64,

    /// Number of txids per validation oracle request
    pub validation_batch_size: usize,

    /// Deadline applied to every collaborator call
    pub request_timeout_secs: u64,

    /// Age after which an unconfirmed transaction is rebroadcast
    pub retry_after_secs: u64,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            tx_history_limit: 40,
            fee_rate_sat_per_byte: 1,
            dust_limit_sats: 546,
            validation_batch_size: 20,
            request_timeout_secs: 30,
            retry_after_secs: 600,
        }
    }
}

impl WalletSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_after_secs as i64)
    }
}

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    /// Numeric network id recorded on every transaction
    pub fn network_id(&self) -> u32 {
        match self {
            NetworkType::Mainnet => 1,
            NetworkType::Testnet => 2,
            NetworkType::Regtest => 3,
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(NetworkType::Mainnet),
            "testnet" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(ConfigError::InvalidNetwork(other.to_string())),
        }
    }
}

impl GlobalConfig {
    /// Create default configuration for a network
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            chain: ChainConfig {
                network,
                rest_url: default_rest_url(network),
                validator_url: default_validator_url(network),
            },
            wallet: WalletSettings::default(),
            data_dir: None,
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::for_network(NetworkType::Mainnet)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Config directory not found")]
    DirectoryNotFound,
}

/// Configuration overrides from CLI arguments or environment variables
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub network: Option<NetworkType>,
    pub rest_url: Option<String>,
    pub validator_url: Option<String>,
    pub data_dir: Option<String>,
    pub tx_history_limit: Option<usize>,
    pub fee_rate_sat_per_byte: Option<u64>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create overrides from `SLP_*` environment variables
    pub fn from_env() -> Self {
        Self {
            network: std::env::var("SLP_NETWORK")
                .ok()
                .and_then(|s| s.parse().ok()),
            rest_url: std::env::var("SLP_REST_URL").ok(),
            validator_url: std::env::var("SLP_VALIDATOR_URL").ok(),
            data_dir: std::env::var("SLP_DATA_DIR").ok(),
            tx_history_limit: std::env::var("SLP_TX_HISTORY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok()),
            fee_rate_sat_per_byte: std::env::var("SLP_FEE_RATE")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Merge with another set of overrides (other takes precedence)
    pub fn merge(mut self, other: Self) -> Self {
        if other.network.is_some() {
            self.network = other.network;
        }
        if other.rest_url.is_some() {
            self.rest_url = other.rest_url;
        }
        if other.validator_url.is_some() {
            self.validator_url = other.validator_url;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.tx_history_limit.is_some() {
            self.tx_history_limit = other.tx_history_limit;
        }
        if other.fee_rate_sat_per_byte.is_some() {
            self.fee_rate_sat_per_byte = other.fee_rate_sat_per_byte;
        }
        self
    }
}

/// Get the default configuration directory path
///
/// Returns: `~/.slp-wallet/`
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".slp-wallet"))
        .ok_or(ConfigError::DirectoryNotFound)
}

/// Get the default configuration file path
///
/// Returns: `~/.slp-wallet/config.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(default_config_dir()?.join("config.json"))
}

/// Resolve the data directory (custom or default)
pub fn data_dir(config: &GlobalConfig) -> Result<PathBuf, ConfigError> {
    match &config.data_dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(default_config_dir()?.join("data")),
    }
}

/// Load configuration from file with overrides
///
/// # Priority (highest to lowest):
/// 1. CLI overrides (passed as argument)
/// 2. Environment variables
/// 3. Config file
/// 4. Network defaults
pub fn load_config(
    config_path: Option<&Path>,
    cli_overrides: ConfigOverrides,
) -> Result<GlobalConfig, ConfigError> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        serde_json::from_str(&contents)?
    } else {
        GlobalConfig::for_network(cli_overrides.network.unwrap_or(NetworkType::Mainnet))
    };

    apply_overrides(&mut config, ConfigOverrides::from_env());
    apply_overrides(&mut config, cli_overrides);

    validate(&config)?;

    Ok(config)
}

/// Save configuration to file, creating parent directories
pub fn save_config(config: &GlobalConfig, config_path: Option<&Path>) -> Result<(), ConfigError> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;

    Ok(())
}

fn validate(config: &GlobalConfig) -> Result<(), ConfigError> {
    if config.wallet.tx_history_limit == 0 {
        return Err(ConfigError::Invalid(
            "tx_history_limit must be at least 1".to_string(),
        ));
    }
    if config.wallet.validation_batch_size == 0 {
        return Err(ConfigError::Invalid(
            "validation_batch_size must be at least 1".to_string(),
        ));
    }
    if config.wallet.fee_rate_sat_per_byte == 0 {
        return Err(ConfigError::Invalid(
            "fee_rate_sat_per_byte must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Apply configuration overrides (internal helper)
fn apply_overrides(config: &mut GlobalConfig, overrides: ConfigOverrides) {
    // Switching network resets endpoints unless they are overridden too
    if let Some(network) = overrides.network {
        if config.chain.network != network {
            config.chain.network = network;
            if overrides.rest_url.is_none() {
                config.chain.rest_url = default_rest_url(network);
            }
            if overrides.validator_url.is_none() {
                config.chain.validator_url = default_validator_url(network);
            }
        }
    }

    if let Some(url) = overrides.rest_url {
        config.chain.rest_url = url;
    }
    if let Some(url) = overrides.validator_url {
        config.chain.validator_url = url;
    }
    if let Some(dir) = overrides.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(limit) = overrides.tx_history_limit {
        config.wallet.tx_history_limit = limit;
    }
    if let Some(rate) = overrides.fee_rate_sat_per_byte {
        config.wallet.fee_rate_sat_per_byte = rate;
    }
}
