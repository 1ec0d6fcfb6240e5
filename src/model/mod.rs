//! Core data model.
//!
//! Events are what producers hand in; batches are what delivery hands out;
//! sessions are what the leader tab publishes for everyone else.

pub mod batch;
pub mod event;
pub mod session;

pub use batch::{Device, EventsBatch, PersistedQueue, RecoveryBacklog};
pub use event::{Event, EventType, Fingerprint, Payload, ScrollDirection};
pub use session::{Session, SessionEndReason, SessionId};

/// Sanitized, JSON-shaped metadata.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
