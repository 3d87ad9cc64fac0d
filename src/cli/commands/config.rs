//! Config command implementations

use crate::config::{ConfigError, GlobalConfig, NetworkType};

/// Initialize configuration file with network-specific defaults
pub fn init(network: Option<String>) -> Result<(), ConfigError> {
    let network_type = match network.as_deref() {
        Some(n) => n.parse::<NetworkType>()?,
        None => NetworkType::Mainnet,
    };

    let config = GlobalConfig::for_network(network_type);
    crate::config::save_config(&config, None)?;

    let config_path = crate::config::default_config_path()?;
    println!("✓ Configuration initialized for {:?}", network_type);
    println!("  Config file: {}", config_path.display());
    println!("  REST API:    {}", config.chain.rest_url);

    Ok(())
}
