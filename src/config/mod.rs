//! Typed agent configuration.
//!
//! Built in code, loaded from a TOML file, or assembled from environment
//! variables. Validation is fail-fast and all-or-nothing: a config either
//! passes `validate()` untouched or the agent refuses to start.
//! Destination tokens are wrapped in `secrecy::SecretString` to keep them
//! out of logs.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Metadata;

/// Where batches are delivered.
#[derive(Debug)]
pub struct DestinationConfig {
    pub name: String,
    pub url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl DestinationConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the core consumes.
#[derive(Debug)]
pub struct AgentConfig {
    /// Inactivity after which the leader ends the session.
    pub session_timeout: Duration,
    /// Probability that a new session is sampled in.
    pub sampling_rate: f64,
    /// Ceiling for identical events within one minute.
    pub max_same_event_per_minute: u32,
    /// Identical events closer together than this are duplicates.
    pub dedup_window: Duration,
    pub flush_interval: Duration,
    pub max_queue_len: usize,
    /// Global rate limit across all event kinds.
    pub max_events_per_second: u32,
    /// Consecutive failures that open a destination's circuit.
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub health_check_interval: Duration,
    /// Persisted batches older than this are discarded on recovery.
    pub recovery_max_age: Duration,
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
    pub election_grace: Duration,
    pub storage_namespace: String,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub global_metadata: Option<Metadata>,
    pub destinations: Vec<DestinationConfig>,
    pub qa_mode: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(15 * 60),
            sampling_rate: 1.0,
            max_same_event_per_minute: 60,
            dedup_window: Duration::from_secs(1),
            flush_interval: Duration::from_secs(10),
            max_queue_len: 100,
            max_events_per_second: 50,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            recovery_max_age: Duration::from_secs(2 * 60 * 60),
            heartbeat_interval: Duration::from_secs(1),
            leader_timeout: Duration::from_secs(5),
            election_grace: Duration::from_millis(150),
            storage_namespace: "pulse".to_string(),
            user_id: None,
            user_agent: None,
            global_metadata: None,
            destinations: Vec::new(),
            qa_mode: false,
        }
    }
}

const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

impl AgentConfig {
    /// Check every bound. Returns the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout < MIN_SESSION_TIMEOUT || self.session_timeout > MAX_SESSION_TIMEOUT {
            return Err(config_error(format!(
                "session_timeout must be between {}s and {}s, got {}s",
                MIN_SESSION_TIMEOUT.as_secs(),
                MAX_SESSION_TIMEOUT.as_secs(),
                self.session_timeout.as_secs()
            )));
        }
        if !(self.sampling_rate > 0.0 && self.sampling_rate <= 1.0) {
            return Err(config_error(format!(
                "sampling_rate must be in (0, 1], got {}",
                self.sampling_rate
            )));
        }
        if self.max_same_event_per_minute == 0 {
            return Err(config_error("max_same_event_per_minute must be at least 1"));
        }
        if self.max_events_per_second == 0 {
            return Err(config_error("max_events_per_second must be at least 1"));
        }
        if self.flush_interval < MIN_FLUSH_INTERVAL {
            return Err(config_error("flush_interval must be at least 1s"));
        }
        if self.max_queue_len == 0 {
            return Err(config_error("max_queue_len must be at least 1"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(config_error("breaker_failure_threshold must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() || self.leader_timeout <= self.heartbeat_interval * 2 {
            return Err(config_error(
                "leader_timeout must exceed twice the heartbeat_interval",
            ));
        }
        if self.storage_namespace.is_empty() || self.storage_namespace.contains(':') {
            return Err(config_error(
                "storage_namespace must be non-empty and must not contain ':'",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for destination in &self.destinations {
            if destination.name.is_empty() {
                return Err(config_error("destination name must not be empty"));
            }
            if !names.insert(destination.name.as_str()) {
                return Err(config_error(format!(
                    "duplicate destination name: {}",
                    destination.name
                )));
            }
            if !(destination.url.starts_with("https://") || destination.url.starts_with("http://")) {
                return Err(config_error(format!(
                    "destination {} must use an http(s) url",
                    destination.name
                )));
            }
        }
        Ok(())
    }

    /// Load a TOML file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| config_error(format!("bad config: {e}")))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Assemble from `PULSE_*` environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = optional_var("PULSE_SESSION_TIMEOUT_SECS") {
            config.session_timeout = Duration::from_secs(parse_var("PULSE_SESSION_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = optional_var("PULSE_SAMPLING_RATE") {
            config.sampling_rate = parse_var("PULSE_SAMPLING_RATE", &v)?;
        }
        if let Some(v) = optional_var("PULSE_FLUSH_INTERVAL_SECS") {
            config.flush_interval = Duration::from_secs(parse_var("PULSE_FLUSH_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = optional_var("PULSE_NAMESPACE") {
            config.storage_namespace = v;
        }
        if let Some(v) = optional_var("PULSE_QA_MODE") {
            config.qa_mode = matches!(v.as_str(), "1" | "true" | "yes");
        }
        config.user_id = optional_var("PULSE_USER_ID");

        if let Some(url) = optional_var("PULSE_ENDPOINT") {
            let mut destination = DestinationConfig::new("default", url);
            destination.api_key = secrets::resolve_token(None, Some("PULSE_API_KEY"));
            config.destinations.push(destination);
        }

        config.validate()?;
        Ok(config)
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(message.into())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| config_error(format!("environment variable {name}: {e}")))
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    session_timeout_secs: u64,
    sampling_rate: f64,
    max_same_event_per_minute: u32,
    dedup_window_ms: u64,
    flush_interval_secs: u64,
    max_queue_len: usize,
    max_events_per_second: u32,
    breaker_failure_threshold: u32,
    breaker_cooldown_secs: u64,
    health_check_interval_secs: u64,
    recovery_max_age_secs: u64,
    heartbeat_interval_ms: u64,
    leader_timeout_ms: u64,
    election_grace_ms: u64,
    storage_namespace: String,
    user_id: Option<String>,
    global_metadata: Option<Metadata>,
    qa_mode: bool,
    destinations: Vec<DestinationFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DestinationFile {
    name: String,
    url: String,
    api_key: Option<String>,
    /// Name of an environment variable holding the key.
    api_key_env: Option<String>,
    timeout_ms: Option<u64>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let d = AgentConfig::default();
        Self {
            session_timeout_secs: d.session_timeout.as_secs(),
            sampling_rate: d.sampling_rate,
            max_same_event_per_minute: d.max_same_event_per_minute,
            dedup_window_ms: d.dedup_window.as_millis() as u64,
            flush_interval_secs: d.flush_interval.as_secs(),
            max_queue_len: d.max_queue_len,
            max_events_per_second: d.max_events_per_second,
            breaker_failure_threshold: d.breaker_failure_threshold,
            breaker_cooldown_secs: d.breaker_cooldown.as_secs(),
            health_check_interval_secs: d.health_check_interval.as_secs(),
            recovery_max_age_secs: d.recovery_max_age.as_secs(),
            heartbeat_interval_ms: d.heartbeat_interval.as_millis() as u64,
            leader_timeout_ms: d.leader_timeout.as_millis() as u64,
            election_grace_ms: d.election_grace.as_millis() as u64,
            storage_namespace: d.storage_namespace,
            user_id: None,
            global_metadata: None,
            qa_mode: false,
            destinations: Vec::new(),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            sampling_rate: self.sampling_rate,
            max_same_event_per_minute: self.max_same_event_per_minute,
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_queue_len: self.max_queue_len,
            max_events_per_second: self.max_events_per_second,
            breaker_failure_threshold: self.breaker_failure_threshold,
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            recovery_max_age: Duration::from_secs(self.recovery_max_age_secs),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            leader_timeout: Duration::from_millis(self.leader_timeout_ms),
            election_grace: Duration::from_millis(self.election_grace_ms),
            storage_namespace: self.storage_namespace,
            user_id: self.user_id,
            user_agent: None,
            global_metadata: self.global_metadata,
            qa_mode: self.qa_mode,
            destinations: self
                .destinations
                .into_iter()
                .map(|d| DestinationConfig {
                    api_key: secrets::resolve_token(d.api_key, d.api_key_env.as_deref()),
                    timeout: d
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(Duration::from_secs(10)),
                    name: d.name,
                    url: d.url,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn sampling_rate_out_of_range_is_rejected() {
        for rate in [0.0, -0.5, 1.5, f64::NAN] {
            let config = AgentConfig {
                sampling_rate: rate,
                ..AgentConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config(_))), "rate {rate}");
        }
    }

    #[test]
    fn session_timeout_bounds() {
        let config = AgentConfig {
            session_timeout: Duration::from_secs(5),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn leader_timeout_must_cover_two_heartbeats() {
        let config = AgentConfig {
            heartbeat_interval: Duration::from_secs(2),
            leader_timeout: Duration::from_secs(3),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_destination_names_are_rejected() {
        let config = AgentConfig {
            destinations: vec![
                DestinationConfig::new("a", "https://one.example"),
                DestinationConfig::new("a", "https://two.example"),
            ],
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate destination name"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            sampling_rate = 0.5
            flush_interval_secs = 5
            storage_namespace = "shop"

            [[destinations]]
            name = "collector"
            url = "https://collect.example/v1/events"
            api_key = "k"
            "#,
        )
        .unwrap();

        assert_eq!(config.sampling_rate, 0.5);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.storage_namespace, "shop");
        assert_eq!(config.session_timeout, Duration::from_secs(900));
        assert_eq!(config.destinations.len(), 1);
        assert!(config.destinations[0].api_key.is_some());
    }

    #[test]
    fn unknown_toml_field_is_rejected() {
        assert!(AgentConfig::from_toml_str("sampling = 1.0").is_err());
    }
}
