//! Versioned state store.
//!
//! One record of named slots shared by the whole agent. Every mutation is
//! queued and applied by a single task, strictly in submission order, and
//! each applied mutation replaces the whole record, so readers always see a
//! complete version and never block behind a writer.
//!
//! Submission happens when [`StateStore::set`] is *called*, not when the
//! returned future is first polled.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};

/// Named slots of the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    SessionId,
    UserId,
    Device,
    ApiUrl,
    PageUrl,
    SampledIn,
    QaMode,
    /// Storage layer had to drop below the durable tier.
    FallbackMode,
    /// Set once the agent finished initialization.
    Initialized,
}

/// An immutable snapshot of the shared record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateRecord {
    version: u64,
    slots: BTreeMap<StateKey, Value>,
}

impl StateRecord {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: StateKey) -> Option<&Value> {
        self.slots.get(&key)
    }
}

type UpdateFn = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;

enum Op {
    Set(Option<Value>),
    Update(UpdateFn),
}

struct Mutation {
    key: StateKey,
    op: Op,
    reply: oneshot::Sender<u64>,
}

/// Serialized, versioned key/value store.
pub struct StateStore {
    current: Arc<RwLock<Arc<StateRecord>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Mutation>>>,
}

impl StateStore {
    /// Create a store and spawn its applier on the current tokio runtime.
    pub fn new() -> Self {
        let current = Arc::new(RwLock::new(Arc::new(StateRecord::default())));
        let (tx, rx) = mpsc::unbounded_channel();
        // Exits on its own once every sender is gone and the queue drains.
        tokio::spawn(apply_mutations(Arc::clone(&current), rx));

        Self {
            current,
            tx: Mutex::new(Some(tx)),
        }
    }

    /// The latest applied snapshot.
    pub fn snapshot(&self) -> Arc<StateRecord> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn get(&self, key: StateKey) -> Option<Value> {
        self.snapshot().get(key).cloned()
    }

    /// Read a slot and deserialize it. A slot holding the wrong shape reads
    /// as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: StateKey) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Queue a write. Resolves to the version that contains it.
    ///
    /// Fails only if the store was torn down or the value cannot be
    /// represented as JSON.
    pub fn set<V: Serialize>(
        &self,
        key: StateKey,
        value: V,
    ) -> impl Future<Output = Result<u64>> + Send + use<V> {
        let submitted = serde_json::to_value(value)
            .map_err(Error::from)
            .and_then(|v| self.submit(key, Op::Set(Some(v))));
        await_reply(submitted)
    }

    /// Queue removal of a slot.
    pub fn remove(&self, key: StateKey) -> impl Future<Output = Result<u64>> + Send + use<> {
        await_reply(self.submit(key, Op::Set(None)))
    }

    /// Queue a read-modify-write. `f` sees the slot as of the moment the
    /// mutation is applied, not as of the call.
    pub fn update<F>(&self, key: StateKey, f: F) -> impl Future<Output = Result<u64>> + Send + use<F>
    where
        F: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
    {
        await_reply(self.submit(key, Op::Update(Box::new(f))))
    }

    /// Queue a write without waiting for the version that applies it.
    pub fn set_detached<V: Serialize>(&self, key: StateKey, value: V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.submit(key, Op::Set(Some(value))).map(drop)
    }

    pub fn remove_detached(&self, key: StateKey) -> Result<()> {
        self.submit(key, Op::Set(None)).map(drop)
    }

    /// Stop accepting writes. Mutations already queued are still applied.
    pub fn close(&self) {
        if self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("state store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn submit(&self, key: StateKey, op: Op) -> Result<oneshot::Receiver<u64>> {
        let (reply, rx) = oneshot::channel();
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(Error::TornDown("state store"))?;
        tx.send(Mutation { key, op, reply })
            .map_err(|_| Error::TornDown("state store"))?;
        Ok(rx)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn await_reply(submitted: Result<oneshot::Receiver<u64>>) -> Result<u64> {
    submitted?
        .await
        .map_err(|_| Error::TornDown("state store"))
}

async fn apply_mutations(
    current: Arc<RwLock<Arc<StateRecord>>>,
    mut rx: mpsc::UnboundedReceiver<Mutation>,
) {
    while let Some(Mutation { key, op, reply }) = rx.recv().await {
        // Only this task writes, so the clone cannot go stale underneath us.
        let mut next = StateRecord::clone(&current.read().unwrap_or_else(PoisonError::into_inner));

        let value = match op {
            Op::Set(value) => value,
            Op::Update(f) => f(next.slots.get(&key)),
        };
        match value {
            Some(value) => {
                next.slots.insert(key, value);
            }
            None => {
                next.slots.remove(&key);
            }
        }
        next.version += 1;

        let version = next.version;
        *current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        let _ = reply.send(version);
    }
}
