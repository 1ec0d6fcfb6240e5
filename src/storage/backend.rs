//! Storage backends.
//!
//! A backend is a synchronous string key/value store, the shape of a web
//! page's storage areas. Synchronous on purpose: page-teardown persistence
//! must not await anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::error::StorageError;

/// Persistence tier, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Origin-scoped, survives reloads, shared by every tab.
    Durable,
    /// Tab-scoped, survives reloads of the same tab only.
    Ephemeral,
    /// In-process map. Lost on reload.
    Memory,
}

impl Tier {
    pub fn name(self) -> &'static str {
        match self {
            Tier::Durable => "durable",
            Tier::Ephemeral => "ephemeral",
            Tier::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A write observed on a shared store, delivered to every other tab.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    /// Tab that performed the write.
    pub source: String,
}

pub trait StorageBackend: Send + Sync {
    fn tier(&self) -> Tier;

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Change notifications for writes made by other tabs, if this backend
    /// is shared.
    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Map-backed store with an optional byte quota.
pub struct MemoryBackend {
    tier: Tier,
    quota_bytes: Option<usize>,
    items: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            quota_bytes: None,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// A store that refuses writes once keys plus values exceed `bytes`.
    pub fn with_quota(tier: Tier, bytes: usize) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::new(tier)
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(quota) = self.quota_bytes {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded {
                    tier: self.tier.name(),
                });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// One file per key under a directory. Used as the durable tier outside a
/// page, e.g. by the operator binary.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            tier: Tier::Durable.name(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn io_error(source: std::io::Error) -> StorageError {
        StorageError::Io {
            tier: Tier::Durable.name(),
            source,
        }
    }
}

impl StorageBackend for FileBackend {
    fn tier(&self) -> Tier {
        Tier::Durable
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(e)),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(Self::io_error)?;
        std::fs::rename(&tmp, &path).map_err(Self::io_error)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_quota_counts_existing_entries() {
        let backend = MemoryBackend::with_quota(Tier::Durable, 20);
        backend.set_item("a", "1234567890").unwrap();
        let err = backend.set_item("b", "1234567890").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { tier: "durable" }));

        // overwriting the same key does not double count
        backend.set_item("a", "123456789012").unwrap();
    }

    #[test]
    fn file_backend_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        assert_eq!(backend.get_item("pulse:session").unwrap(), None);
        backend.set_item("pulse:session", "{\"a\":1}").unwrap();
        assert_eq!(
            backend.get_item("pulse:session").unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        backend.remove_item("pulse:session").unwrap();
        backend.remove_item("pulse:session").unwrap();
        assert_eq!(backend.get_item("pulse:session").unwrap(), None);
    }
}
