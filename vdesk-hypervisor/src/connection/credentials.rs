//! Named credential sets referenced by host connection descriptors.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// A username with a password and/or an SSH private key.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to an SSH private key on the control-plane machine
    #[serde(default)]
    pub key_path: Option<String>,
}

impl Credential {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            key_path: None,
        }
    }

    pub fn key(username: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            key_path: Some(key_path.into()),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// In-memory store of credential sets by name.
#[derive(Default)]
pub struct CredentialStore {
    entries: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a credential set.
    pub fn insert(&self, name: impl Into<String>, credential: Credential) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(name.into(), credential);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(name))
            .unwrap_or(false)
    }

    /// Resolve a credential reference. A dangling reference is a configuration error.
    pub fn resolve(&self, name: &str) -> Result<Credential> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ControlError::internal(name, "credential store lock poisoned"))?;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::configuration(name, "unknown credential reference"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::password("administrator", "hunter2");
        let debug = format!("{:?}", cred);
        assert!(debug.contains("administrator"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_resolve() {
        let store = CredentialStore::new();
        store.insert("kvm-root", Credential::key("root", "/etc/vdesk/id_ed25519"));

        assert_eq!(store.resolve("kvm-root").unwrap().username, "root");
        assert!(matches!(
            store.resolve("missing"),
            Err(ControlError::Configuration { .. })
        ));
    }
}
