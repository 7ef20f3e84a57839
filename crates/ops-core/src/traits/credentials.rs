//! Credential provider abstraction

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh_keys::key::KeyPair;

use crate::error::TransportError;

/// Material used to authenticate an upstream connection
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password { username: String, password: String },
    /// Public key authentication
    PrivateKey { username: String, key: Arc<KeyPair> },
}

impl Credential {
    /// The user name to authenticate as
    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } | Credential::PrivateKey { username, .. } => {
                username
            }
        }
    }

    /// Authentication method name, for logs
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::PrivateKey { .. } => "publickey",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username())
            .field("method", &self.method())
            .finish()
    }
}

/// Produces an authenticator for a target
///
/// Keeps the bridge agnostic of where keys and passwords are stored.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credential to use when connecting to `target`
    async fn credential_for(&self, target: &str) -> Result<Credential, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let credential = Credential::Password {
            username: "root".to_string(),
            password: "hunter2".to_string(),
        };

        let debug = format!("{:?}", credential);
        assert!(debug.contains("root"));
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }
}
