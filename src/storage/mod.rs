//! Tiered persistence.
//!
//! Writes go to the first tier that accepts them: durable, then ephemeral,
//! then an in-process map that always accepts ("memory-only mode"). Callers
//! never see a storage error. A record that fails to parse is treated as
//! absent and cleared.
//!
//! Capability is probed once, at construction. A tier that passed the probe
//! can still fail later (a quota filling up mid-session), so every call
//! tolerates per-tier failures anyway.

pub mod backend;
pub mod origin;

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::telemetry::metrics;

pub use backend::{FileBackend, MemoryBackend, StorageBackend, StorageChange, Tier};
pub use origin::{OriginHandle, OriginStore};

/// Logical keys of the persisted state layout.
pub mod keys {
    pub const SESSION: &str = "session";
    pub const QUEUE_RECOVERY: &str = "queue-recovery";
    pub const TAB_INFO: &str = "tab-info";
    pub const QA_MODE: &str = "qa-mode";
    /// Cross-tab messages, when no broadcast channel is available.
    pub const TAB_SIGNAL: &str = "tab-signal";
}

const PROBE_KEY: &str = "__probe__";

/// Which tiers passed the startup probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub durable: bool,
    pub ephemeral: bool,
}

struct Slot {
    backend: Arc<dyn StorageBackend>,
    usable: bool,
}

/// Tiered storage with transparent fallback and corruption recovery.
pub struct StorageManager {
    namespace: String,
    slots: Vec<Slot>,
    capability: Capability,
    fallback_mode: AtomicBool,
    persistence_failures: AtomicU64,
    qa_mode: AtomicBool,
    last_tier: Mutex<Option<Tier>>,
}

impl StorageManager {
    /// Build the tier chain and probe it. The memory tier is always appended.
    pub fn new(
        namespace: impl Into<String>,
        durable: Option<Arc<dyn StorageBackend>>,
        ephemeral: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        let namespace = namespace.into();
        let memory: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(Tier::Memory));

        let mut slots = Vec::new();
        let mut capability = Capability {
            durable: false,
            ephemeral: false,
        };
        for backend in [durable, ephemeral].into_iter().flatten() {
            let usable = probe(&namespace, backend.as_ref());
            match backend.tier() {
                Tier::Durable => capability.durable |= usable,
                Tier::Ephemeral => capability.ephemeral |= usable,
                Tier::Memory => {}
            }
            if !usable {
                debug!(tier = %backend.tier(), "storage tier failed capability probe");
            }
            slots.push(Slot { backend, usable });
        }
        slots.push(Slot {
            backend: memory,
            usable: true,
        });

        let fallback = !capability.durable;
        if fallback {
            info!("durable storage unavailable, running in fallback mode");
        }

        Self {
            namespace,
            slots,
            capability,
            fallback_mode: AtomicBool::new(fallback),
            persistence_failures: AtomicU64::new(0),
            qa_mode: AtomicBool::new(false),
            last_tier: Mutex::new(None),
        }
    }

    /// Memory tier only: nothing survives a reload.
    pub fn memory_only(namespace: impl Into<String>) -> Self {
        Self::new(namespace, None, None)
    }

    /// Result of the one-time capability probe.
    pub fn probe_capability(&self) -> Capability {
        self.capability
    }

    /// True once any write had to go below the durable tier, or the durable
    /// tier was unavailable from the start.
    pub fn is_fallback_mode(&self) -> bool {
        self.fallback_mode.load(Ordering::Relaxed)
    }

    /// The tier that accepted the most recent write, or the best usable tier
    /// if nothing was written yet.
    pub fn active_tier(&self) -> Tier {
        let last = *self.last_tier.lock().unwrap_or_else(PoisonError::into_inner);
        last.unwrap_or_else(|| {
            self.slots
                .iter()
                .find(|s| s.usable)
                .map(|s| s.backend.tier())
                .unwrap_or(Tier::Memory)
        })
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Louder logging of absorbed failures.
    pub fn set_qa_mode(&self, enabled: bool) {
        self.qa_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn full_key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    /// Read and parse a record. Missing, unreadable and corrupted records all
    /// read as `None`; a corrupted record is removed from its tier.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.full_key(key);
        for slot in self.slots.iter().filter(|s| s.usable) {
            let raw = match slot.backend.get_item(&full_key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    self.absorb(slot.backend.tier(), &full_key, &e);
                    continue;
                }
            };

            return match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %full_key, tier = %slot.backend.tier(), error = %e, "corrupted record cleared");
                    let _ = slot.backend.remove_item(&full_key);
                    None
                }
            };
        }
        None
    }

    /// Persist a record. Never fails; returns the tier that accepted it.
    pub fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Tier {
        let full_key = self.full_key(key);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                // Not representable: nothing any tier could do with it.
                warn!(key = %full_key, error = %e, "record not serializable, dropped");
                self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                return Tier::Memory;
            }
        };

        for (index, slot) in self.slots.iter().enumerate().filter(|(_, s)| s.usable) {
            match slot.backend.set_item(&full_key, &raw) {
                Ok(()) => {
                    // Older copies elsewhere would shadow or outlive this one.
                    self.clear_other_tiers(index, &full_key);
                    let tier = slot.backend.tier();
                    *self.last_tier.lock().unwrap_or_else(PoisonError::into_inner) = Some(tier);
                    return tier;
                }
                Err(e) => {
                    self.absorb(slot.backend.tier(), &full_key, &e);
                    self.fallback_mode.store(true, Ordering::Relaxed);
                    metrics::storage_fallbacks()
                        .add(1, &[KeyValue::new("tier", slot.backend.tier().name())]);
                }
            }
        }

        // The memory tier accepts everything, so this is unreachable in practice.
        Tier::Memory
    }

    /// Remove a record from every tier.
    pub fn remove(&self, key: &str) {
        let full_key = self.full_key(key);
        for slot in self.slots.iter().filter(|s| s.usable) {
            if let Err(e) = slot.backend.remove_item(&full_key) {
                self.absorb(slot.backend.tier(), &full_key, &e);
            }
        }
    }

    /// Changes other tabs made to the shared durable tier, if there is one.
    pub fn subscribe_changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        self.slots
            .iter()
            .filter(|s| s.usable && s.backend.tier() == Tier::Durable)
            .find_map(|s| s.backend.subscribe())
    }

    fn clear_other_tiers(&self, accepted: usize, full_key: &str) {
        for (index, slot) in self.slots.iter().enumerate() {
            if index != accepted && slot.usable {
                let _ = slot.backend.remove_item(full_key);
            }
        }
    }

    fn absorb(&self, tier: Tier, key: &str, error: &StorageError) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        if self.qa_mode.load(Ordering::Relaxed) {
            info!(%tier, key, %error, "storage tier failed, falling back");
        } else {
            debug!(%tier, key, %error, "storage tier failed, falling back");
        }
    }
}

fn probe(namespace: &str, backend: &dyn StorageBackend) -> bool {
    let key = format!("{namespace}:{PROBE_KEY}");
    let ok = backend.set_item(&key, "1").is_ok()
        && matches!(backend.get_item(&key), Ok(Some(ref v)) if v == "1");
    let _ = backend.remove_item(&key);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    #[test]
    fn memory_only_round_trips() {
        let storage = StorageManager::memory_only("t");
        assert!(storage.is_fallback_mode());
        assert_eq!(storage.write(keys::SESSION, &Record { n: 1 }), Tier::Memory);
        assert_eq!(storage.read::<Record>(keys::SESSION), Some(Record { n: 1 }));
    }

    #[test]
    fn corrupted_record_reads_as_absent_and_is_cleared() {
        let durable = Arc::new(MemoryBackend::new(Tier::Durable));
        let storage = StorageManager::new("t", Some(durable.clone() as Arc<dyn StorageBackend>), None);

        durable.set_item("t:session", "{not json").unwrap();
        assert_eq!(storage.read::<Record>(keys::SESSION), None);
        assert_eq!(durable.get_item("t:session").unwrap(), None);
    }

    #[test]
    fn schema_mismatch_is_corruption_too() {
        let durable = Arc::new(MemoryBackend::new(Tier::Durable));
        let storage = StorageManager::new("t", Some(durable.clone() as Arc<dyn StorageBackend>), None);

        durable.set_item("t:session", r#"{"n":"nope"}"#).unwrap();
        assert_eq!(storage.read::<Record>(keys::SESSION), None);
        assert_eq!(durable.get_item("t:session").unwrap(), None);
    }

    #[test]
    fn probe_excludes_a_dead_tier() {
        let durable = Arc::new(MemoryBackend::with_quota(Tier::Durable, 0));
        let storage = StorageManager::new("t", Some(durable), None);

        assert!(!storage.probe_capability().durable);
        assert!(storage.is_fallback_mode());
        assert_eq!(storage.write(keys::SESSION, &Record { n: 2 }), Tier::Memory);
    }
}
