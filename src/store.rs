//! Persisted client keys
//!
//! Opaque string key/value storage for the handful of values that survive a
//! restart: endpoint, remembered secure endpoint, model selection, tokens.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub mod keys {
    pub const BRIDGE_URL: &str = "bridge_url";
    pub const BRIDGE_HTTPS_URL: &str = "bridge_https_url";
    pub const SELECTED_MODEL: &str = "selected_model";
    pub const ACCESS_TOKEN: &str = "auth.access_token";
    pub const REFRESH_TOKEN: &str = "auth.refresh_token";
    pub const EXPIRES_AT: &str = "auth.expires_at";
    pub const PROJECT_ID: &str = "auth.project_id";
    pub const CODE_VERIFIER: &str = "auth.code_verifier";

    /// Every key owned by the auth flow; cleared together
    pub const AUTH: [&str; 5] = [ACCESS_TOKEN, REFRESH_TOKEN, EXPIRES_AT, PROJECT_ID, CODE_VERIFIER];
}

pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// JSON file backed store, written through on every change
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
            match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable key store");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(values).map_err(|e| Error::Storage(e.to_string()))?;
        fs::write(&self.path, content)
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", self.path.display(), e)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("key store lock poisoned".into()))
    }
}

impl KeyStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.lock()?;
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.lock()?;
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

/// Volatile store for tests and one-shot runs
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("key store lock poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("key store lock poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        let store = FileStore::open(&path).unwrap();
        store.set(keys::SELECTED_MODEL, "gemini:gemini-2.5-pro").unwrap();
        store.set(keys::BRIDGE_URL, "http://127.0.0.1:8787").unwrap();
        store.remove(keys::BRIDGE_URL).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(keys::SELECTED_MODEL).as_deref(),
            Some("gemini:gemini-2.5-pro")
        );
        assert_eq!(reopened.get(keys::BRIDGE_URL), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(keys::SELECTED_MODEL), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
        store.remove("a").unwrap();
        assert_eq!(store.get("a"), None);
    }
}
