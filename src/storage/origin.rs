//! Origin-scoped store shared by every tab of the same origin.
//!
//! Wraps one backend and fans out a [`StorageChange`] for each write, so a
//! tab can observe what other tabs wrote. Each change names the writing tab
//! so receivers can skip their own.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::backend::{StorageBackend, StorageChange, Tier};
use crate::error::StorageError;

const CHANGE_CAPACITY: usize = 256;

/// The shared store itself. Hand each tab its own [`OriginStore::handle`].
pub struct OriginStore {
    inner: Arc<dyn StorageBackend>,
    changes: broadcast::Sender<StorageChange>,
}

impl OriginStore {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Arc::new(Self { inner, changes })
    }

    /// A per-tab view. Writes through it are announced as coming from `tab_id`.
    pub fn handle(self: &Arc<Self>, tab_id: impl Into<String>) -> OriginHandle {
        OriginHandle {
            store: Arc::clone(self),
            tab_id: tab_id.into(),
        }
    }

    fn announce(&self, key: &str, new_value: Option<&str>, source: &str) {
        // No receivers is fine: nobody else is listening yet.
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
            source: source.to_string(),
        });
    }
}

/// One tab's access to the origin store.
pub struct OriginHandle {
    store: Arc<OriginStore>,
    tab_id: String,
}

impl OriginHandle {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }
}

impl StorageBackend for OriginHandle {
    fn tier(&self) -> Tier {
        self.store.inner.tier()
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store.inner.set_item(key, value)?;
        self.store.announce(key, Some(value), &self.tab_id);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.store.inner.remove_item(key)?;
        self.store.announce(key, None, &self.tab_id);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
        Some(self.store.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;

    #[tokio::test]
    async fn writes_are_visible_and_announced_to_other_tabs() {
        let origin = OriginStore::new(Arc::new(MemoryBackend::new(Tier::Durable)));
        let a = origin.handle("tab-a");
        let b = origin.handle("tab-b");

        let mut changes = b.subscribe().unwrap();
        a.set_item("k", "v").unwrap();

        assert_eq!(b.get_item("k").unwrap().as_deref(), Some("v"));
        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.source, "tab-a");
        assert_eq!(change.new_value.as_deref(), Some("v"));
    }
}
