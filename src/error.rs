//! Error types for pulse-agent.
//!
//! Validation and config errors are loud and synchronous. Storage, delivery
//! and coordination errors are absorbed close to where they happen and only
//! show up in diagnostics; their types live here so the absorbing code can
//! name what it swallowed.

use std::sync::Arc;

use thiserror::Error;

use crate::sanitize::Rejection;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(#[from] Rejection),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("agent is not initialized")]
    NotInitialized,

    /// Initialization failed. Every caller of `init` gets the same cause.
    #[error("initialization failed: {0}")]
    Init(Arc<Error>),

    /// The component was torn down while the operation was in flight.
    #[error("{0} has been torn down")]
    TornDown(&'static str),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure of a single storage tier.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend refused the write because it is full.
    #[error("quota exceeded in {tier} store")]
    QuotaExceeded { tier: &'static str },

    /// The backend is not usable in this context (disabled, sandboxed, ...).
    #[error("{tier} store unavailable: {reason}")]
    Unavailable { tier: &'static str, reason: String },

    #[error("io error in {tier} store: {source}")]
    Io {
        tier: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of one delivery attempt to one destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("destination {0} timed out")]
    Timeout(String),

    #[error("destination {destination} rejected batch with status {status}")]
    Rejected { destination: String, status: u16 },

    #[error("transport error for {destination}: {reason}")]
    Transport { destination: String, reason: String },
}

impl DeliveryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeliveryError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
