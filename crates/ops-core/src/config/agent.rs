//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the remote execution agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host key file (generated on first start)
    pub host_key_path: PathBuf,

    /// Password accepted for any user. Password auth is disabled when unset.
    pub password: Option<String>,

    /// `authorized_keys` files whose keys are accepted
    pub authorized_keys: Vec<PathBuf>,

    /// Files followed by the `logs` command
    pub log_files: Vec<PathBuf>,

    /// Refresh interval of the `process` command, in seconds
    pub monitor_interval: u32,

    /// How long shutdown waits for sessions to wind down
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key_path: super::default_config_dir().join("host_key"),
            password: None,
            authorized_keys: vec![PathBuf::from("~/.ssh/authorized_keys")],
            log_files: vec![
                PathBuf::from("/var/log/php.log"),
                PathBuf::from("/var/log/apache/error_log"),
            ],
            monitor_interval: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:2222");
        assert_eq!(config.log_files.len(), 2);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
password = "letmein"
log_files = ["/tmp/a.log"]
shutdown_grace = 1
"#,
        )
        .unwrap();

        assert_eq!(config.password.as_deref(), Some("letmein"));
        assert_eq!(config.log_files, vec![PathBuf::from("/tmp/a.log")]);
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.monitor_interval, 2);
    }
}
