//! Credentials for upstream SSH connections

use std::sync::Arc;

use async_trait::async_trait;
use russh_keys::key::KeyPair;

use ops_core::config::UpstreamConfig;
use ops_core::error::TransportError;
use ops_core::traits::{Credential, CredentialProvider};

/// Credentials taken from the gateway configuration
///
/// The same credential is used for every target. A private key wins over
/// a password when both are configured.
pub struct ConfiguredCredentials {
    username: String,
    key: Option<Arc<KeyPair>>,
    password: Option<String>,
}

impl ConfiguredCredentials {
    /// Load the configured key (if the file exists) and password
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, TransportError> {
        let key = match &config.private_key_path {
            Some(path) if path.exists() => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    TransportError::Credential(format!("Failed to load key {:?}: {}", path, e))
                })?;
                tracing::info!("Using private key {:?} for upstream auth", path);
                Some(Arc::new(key))
            }
            Some(path) => {
                tracing::debug!("Private key {:?} not found", path);
                None
            }
            None => None,
        };

        if key.is_none() && config.password.is_none() {
            tracing::warn!("No upstream private key or password configured - every dial will fail");
        }

        Ok(Self {
            username: config.username.clone(),
            key,
            password: config.password.clone(),
        })
    }

    /// Password-only credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            key: None,
            password: Some(password.into()),
        }
    }
}

#[async_trait]
impl CredentialProvider for ConfiguredCredentials {
    async fn credential_for(&self, _target: &str) -> Result<Credential, TransportError> {
        if let Some(key) = &self.key {
            return Ok(Credential::PrivateKey {
                username: self.username.clone(),
                key: Arc::clone(key),
            });
        }

        match &self.password {
            Some(password) => Ok(Credential::Password {
                username: self.username.clone(),
                password: password.clone(),
            }),
            None => Err(TransportError::Credential(
                "no private key or password configured".to_string(),
            )),
        }
    }
}
