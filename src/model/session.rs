//! Session identity and lifecycle records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_ms;

/// Newtype for session IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shared session, as published by the leader tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Wall-clock millis.
    pub started_at: i64,
    /// Wall-clock millis of the latest activity seen by any tab.
    pub last_activity_at: i64,
    pub is_sampled_in: bool,
}

impl Session {
    pub fn start(is_sampled_in: bool) -> Self {
        let now = now_ms();
        Self {
            id: SessionId::new(),
            started_at: now,
            last_activity_at: now,
            is_sampled_in,
        }
    }

    /// Whether the session has been idle for longer than `timeout_ms` as of `now`.
    pub fn is_expired(&self, now: i64, timeout_ms: i64) -> bool {
        now.saturating_sub(self.last_activity_at) > timeout_ms
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Inactivity,
    Manual,
    PageUnload,
    /// The previous page went away without a clean teardown; synthesized on
    /// the next load.
    Unexpected,
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionEndReason::Inactivity => "inactivity",
            SessionEndReason::Manual => "manual",
            SessionEndReason::PageUnload => "page_unload",
            SessionEndReason::Unexpected => "unexpected",
        };
        write!(f, "{s}")
    }
}
