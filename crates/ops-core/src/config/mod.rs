//! Configuration management for the ServerOps bridge

mod agent;
mod gateway;
pub mod serde_utils;

pub use agent::AgentConfig;
pub use gateway::{GatewayConfig, PtyConfig, SessionErrorPolicy, TargetPolicy, UpstreamConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("serverops")
}

/// Default path of the gateway configuration file
pub fn default_gateway_config_path() -> PathBuf {
    default_config_dir().join("gateway.toml")
}

/// Default path of the agent configuration file
pub fn default_agent_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration from `path` if given, else from `default_path` when
/// it exists, else fall back to defaults.
///
/// An explicitly requested file that is missing or broken is an error; a
/// broken default file only logs a warning.
pub fn load_or_default<T>(path: Option<&Path>, default_path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if let Some(path) = path {
        return load_config(path);
    }

    if default_path.exists() {
        Ok(load_config(default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            T::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(T::default())
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
