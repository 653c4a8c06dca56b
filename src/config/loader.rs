// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AggregatorConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_yaml_str(content: &str) -> Result<AggregatorConfig> {
        let content = Self::substitute_env_vars(content);

        let config: AggregatorConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${LOG_DIR:-/var/log/aggregator} -> /var/log/aggregator (if LOG_DIR not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("static pattern");

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    if let Some(default) = default_value {
                        default.to_string()
                    } else {
                        // Leave the placeholder as-is when unset with no default
                        format!("${{{}}}", var_name)
                    }
                }
            }
        })
        .to_string()
    }

    /// Validate daemon-level settings and category naming.
    ///
    /// Store trees are checked when they are built, so a reload reports the
    /// failing store with its category.
    pub(crate) fn validate(config: &AggregatorConfig) -> Result<()> {
        if config.aggregator.check_interval_ms == 0 {
            bail!("aggregator.check_interval_ms must be > 0");
        }

        if config.aggregator.counters_interval_seconds == 0 {
            bail!("aggregator.counters_interval_seconds must be > 0");
        }

        let mut prefixes = HashSet::new();
        for (index, category) in config.categories.iter().enumerate() {
            let names = category.names();
            if names.is_empty() {
                bail!("categories[{}] has neither 'category' nor 'categories'", index);
            }

            for name in names {
                if name.is_empty() || name == "*" {
                    bail!("categories[{}] has an empty category name", index);
                }
                if let Some(prefix) = name.strip_suffix('*') {
                    if !prefixes.insert(prefix.to_string()) {
                        bail!("prefix category '{}' is configured more than once", name);
                    }
                }
            }

            let queue = &category.queue;
            if queue.max_queue_length == 0 {
                bail!("categories[{}].queue.max_queue_length must be > 0", index);
            }
            if queue.max_batch_size == 0 {
                bail!("categories[{}].queue.max_batch_size must be > 0", index);
            }
            if queue.retry_backoff_multiplier < 1.0 {
                bail!("categories[{}].queue.retry_backoff_multiplier must be >= 1.0", index);
            }
            if queue.retry_initial_backoff_ms > queue.retry_max_backoff_ms {
                bail!(
                    "categories[{}].queue.retry_initial_backoff_ms exceeds retry_max_backoff_ms",
                    index
                );
            }
        }

        Ok(())
    }
}
