//! Client authentication
//!
//! Two methods, each optional: a shared password from the config and
//! public keys from `authorized_keys` files. With neither configured
//! every connection is rejected.

mod keys;

pub use keys::AuthorizedKeys;

use anyhow::Result;
use russh_keys::key::PublicKey;

use ops_core::config::AgentConfig;

/// Decides whether a connecting client may open sessions
#[derive(Debug, Default, Clone)]
pub struct Authenticator {
    password: Option<String>,
    keys: AuthorizedKeys,
}

impl Authenticator {
    /// Build from explicit parts
    pub fn new(password: Option<String>, keys: AuthorizedKeys) -> Self {
        Self { password, keys }
    }

    /// Build from the agent config, reading `authorized_keys` files
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let keys = AuthorizedKeys::load_from_files(&config.authorized_keys)?;
        let auth = Self::new(config.password.clone(), keys);

        if !auth.accepts_anything() {
            tracing::warn!("No password or authorized keys configured - all connections will be rejected");
        } else {
            tracing::info!(
                "Authentication: password {}, {} authorized keys",
                if auth.password.is_some() { "enabled" } else { "disabled" },
                auth.keys.len()
            );
        }

        Ok(auth)
    }

    /// Whether any method can succeed
    pub fn accepts_anything(&self) -> bool {
        self.password.is_some() || !self.keys.is_empty()
    }

    /// Check a password attempt
    pub fn check_password(&self, password: &str) -> bool {
        self.password
            .as_deref()
            .is_some_and(|expected| expected == password)
    }

    /// Check a public key attempt
    pub fn check_key(&self, key: &PublicKey) -> bool {
        self.keys.contains(key)
    }
}
