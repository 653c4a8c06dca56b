// Configuration module for log-aggregator
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AggregatorConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<AggregatorConfig> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(listen) = std::env::var("AGGREGATOR_LISTEN") {
        config.server.listen = listen;
    }

    if let Ok(max_rate) = std::env::var("AGGREGATOR_MAX_MSG_PER_SECOND") {
        config.aggregator.max_msg_per_second = max_rate
            .parse()
            .context("AGGREGATOR_MAX_MSG_PER_SECOND must be an integer")?;
    }

    Ok(config)
}
