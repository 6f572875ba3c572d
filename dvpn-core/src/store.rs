//! Preference persistence
//!
//! Small key/value store for values that outlive a bridge session, such as
//! the node of the last successful connection.

use crate::error::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Key under which the last connected node is kept
pub const LAST_NODE_KEY: &str = "last_node_id";

/// Key/value preference storage
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Preferences kept as a flat TOML table
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    guard: Mutex<()>,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_failed(&self, message: impl ToString) -> StoreError {
        StoreError::ReadFailed {
            path: self.path.to_string_lossy().to_string(),
            message: message.to_string(),
        }
    }

    fn write_failed(&self, message: impl ToString) -> StoreError {
        StoreError::WriteFailed {
            path: self.path.to_string_lossy().to_string(),
            message: message.to_string(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| self.read_failed(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.read_failed(e)),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let contents = toml::to_string(values).map_err(|e| self.write_failed(e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.write_failed(e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| self.write_failed(e))?;
        debug!("Saved preferences to {:?}", self.path);
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock();
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock();
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FilePreferenceStore::new(dir.path().join("prefs").join("preferences.toml"));

        assert_eq!(store.get(LAST_NODE_KEY).unwrap(), None);
        store.set(LAST_NODE_KEY, "0xnode").unwrap();
        store.set("theme", "dark").unwrap();
        assert_eq!(store.get(LAST_NODE_KEY).unwrap(), Some("0xnode".to_string()));

        store.remove(LAST_NODE_KEY).unwrap();
        assert_eq!(store.get(LAST_NODE_KEY).unwrap(), None);
        assert_eq!(store.get("theme").unwrap(), Some("dark".to_string()));
    }

    #[test]
    fn test_corrupt_file_is_read_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preferences.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let store = FilePreferenceStore::new(&path);
        assert!(matches!(store.get(LAST_NODE_KEY), Err(StoreError::ReadFailed { .. })));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryPreferenceStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
