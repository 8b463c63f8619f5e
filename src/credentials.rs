//! Username/password stores consulted by the authenticator

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "Pa$$w0rd";

pub trait CredentialStore: Send + Sync {
    /// Exact match of both fields
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Fixed in-memory map
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }
}

/// JSON object `{"user": "password"}` on disk, re-read on every check so
/// edits take effect without restarting the relay.
#[derive(Clone, Debug)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    /// Open the store, seeding it with the default account when the file is missing
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
            let mut seed = HashMap::new();
            seed.insert(DEFAULT_USER.to_string(), DEFAULT_PASSWORD.to_string());
            let body = serde_json::to_string_pretty(&seed).context("serialize default credentials")?;
            fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
            warn!(path = %path.display(), user = DEFAULT_USER, "created credential store with the default account; change its password");
        }
        let store = Self { path: path.to_path_buf() };
        store.load()?;
        Ok(store)
    }

    pub fn load(&self) -> Result<HashMap<String, String>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", self.path.display()))
    }
}

impl CredentialStore for FileCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        match self.load() {
            Ok(users) => users.get(username).is_some_and(|p| p == password),
            Err(e) => {
                warn!(error = %e, "credential store unreadable, rejecting login");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_requires_exact_match() {
        let store = StaticCredentials::default().with_user("alice", "secret");
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "Secret"));
        assert!(!store.verify("Alice", "secret"));
        assert!(!store.verify("bob", "secret"));
    }

    #[test]
    fn file_store_seeds_default_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials/users_creds.json");
        let store = FileCredentials::open(&path).unwrap();
        assert!(store.verify(DEFAULT_USER, DEFAULT_PASSWORD));
    }

    #[test]
    fn file_store_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, r#"{"alice": "secret"}"#).unwrap();
        let store = FileCredentials::open(&path).unwrap();
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify(DEFAULT_USER, DEFAULT_PASSWORD));

        fs::write(&path, r#"{"alice": "changed"}"#).unwrap();
        assert!(!store.verify("alice", "secret"));
        assert!(store.verify("alice", "changed"));
    }

    #[test]
    fn corrupt_file_is_rejected_on_open_and_denies_logins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, r#"{"alice": "secret"}"#).unwrap();
        let store = FileCredentials::open(&path).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(!store.verify("alice", "secret"));
        assert!(FileCredentials::open(&path).is_err());
    }
}
