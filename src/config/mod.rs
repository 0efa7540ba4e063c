mod depend;
mod duration;
mod schema;

pub use depend::{resolve_order, DependencyError, DependencyNode};
pub use duration::{parse_duration, DurationError, DurationValue};
pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error(transparent)]
    Duration(#[from] DurationError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("writeq watermarks must satisfy high > low > 0 (high {high}, low {low})")]
    Watermarks { high: usize, low: usize },

    #[error("service '{service}' has no targets")]
    NoTargets { service: String },
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

impl Config {
    /// Validate invariants the schema itself cannot express, and return
    /// the order in which named objects must be constructed.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let strict = self.server.strict_config;
        self.users.refresh_interval.resolve(strict)?;
        self.limits.dns_cache_ttl.resolve(strict)?;

        let high = self.limits.writeq_high_water;
        let low = self.limits.writeq_low_water;
        if !(high > low && low > 0) {
            return Err(ConfigError::Watermarks { high, low });
        }

        if self.service.targets.is_empty() {
            return Err(ConfigError::NoTargets {
                service: self.service.name.clone(),
            });
        }

        Ok(resolve_order(&self.dependency_nodes())?)
    }
}
