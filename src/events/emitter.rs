//! Subscriber registry for queued events and built batches.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::model::{Event, EventsBatch};

/// Handle returned by `subscribe_*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;
pub type BatchListener = Arc<dyn Fn(&EventsBatch) + Send + Sync>;

#[derive(Default)]
pub struct Emitter {
    next_id: AtomicU64,
    events: RwLock<Vec<(SubscriptionId, EventListener)>>,
    batches: RwLock<Vec<(SubscriptionId, BatchListener)>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_events<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next();
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn subscribe_batches<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&EventsBatch) + Send + Sync + 'static,
    {
        let id = self.next();
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sid, _)| {
                let keep = *sid != id;
                removed |= !keep;
                keep
            });
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sid, _)| {
                let keep = *sid != id;
                removed |= !keep;
                keep
            });
        removed
    }

    pub fn emit_event(&self, event: &Event) {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<EventListener> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("event listener panicked");
            }
        }
    }

    pub fn emit_batch(&self, batch: &EventsBatch) {
        let listeners: Vec<BatchListener> = self
            .batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(batch))).is_err() {
                warn!("batch listener panicked");
            }
        }
    }

    fn next(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
