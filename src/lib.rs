//! # pulse-agent
//!
//! Client-side telemetry agent core: event delivery and resilience.
//!
//! Producers hand typed events to the [`events::EventManager`], which
//! deduplicates, rate-limits, batches and delivers them through a
//! per-destination circuit breaker, persisting whatever could not be sent
//! through the tiered [`storage`] layer. Tabs of the same origin elect one
//! leader through the [`coordinator`] so that exactly one session is live at
//! a time. Shared identity lives in the serialized [`state`] store, and every
//! piece of user-supplied metadata passes the [`sanitize`] module first.
//!
//! [`agent::Agent`] wires all of it together.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod model;
pub mod sanitize;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use agent::{Agent, Environment, Lifecycle};
pub use config::AgentConfig;
pub use error::{Error, Result};
