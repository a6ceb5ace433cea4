mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Checks serde cannot express: server names must be unique and present
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::Invalid("no [[servers]] configured".into()));
    }
    let mut names = HashSet::new();
    for server in &config.servers {
        if !names.insert(server.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }
    }
    Ok(())
}
