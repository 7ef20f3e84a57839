//! `authorized_keys` parsing

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::PublicKey;

/// Fingerprints of keys accepted for public key authentication
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeys {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every readable file in `paths`; missing files are skipped
    pub fn load_from_files(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut keys = Self::new();

        for path in paths {
            let path = expand_home(path.as_ref());
            if path.exists() {
                keys.load_from_file(&path)?;
            } else {
                tracing::debug!("Authorized keys file not found: {:?}", path);
            }
        }

        Ok(keys)
    }

    /// Load one file
    pub fn load_from_file(&mut self, path: &Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;

        let mut loaded = 0;
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_line(line) {
                Some(key) => {
                    self.insert(&key);
                    loaded += 1;
                }
                None => {
                    tracing::warn!("Skipping unparsable key on line {} of {:?}", index + 1, path);
                }
            }
        }

        tracing::info!("Loaded {} authorized keys from {:?}", loaded, path);
        Ok(loaded)
    }

    /// Accept `key`
    pub fn insert(&mut self, key: &PublicKey) {
        self.fingerprints.insert(key.fingerprint());
    }

    /// Whether `key` is accepted
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint())
    }

    /// Number of accepted keys
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// True when no key is accepted
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Parse `[options] <type> <base64> [comment]`
fn parse_line(line: &str) -> Option<PublicKey> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields.windows(2).find_map(|pair| {
        is_key_type(pair[0])
            .then(|| russh_keys::parse_public_key_base64(pair[1]).ok())
            .flatten()
    })
}

fn is_key_type(field: &str) -> bool {
    field.starts_with("ssh-") || field.starts_with("ecdsa-") || field.starts_with("sk-")
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
