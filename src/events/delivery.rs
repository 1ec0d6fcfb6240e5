//! Delivery destinations.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::config::{DestinationConfig, secrets};
use crate::error::{DeliveryError, Error, Result};
use crate::model::EventsBatch;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Somewhere batches go. Implementations must not mutate the batch.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// One delivery attempt.
    async fn send(&self, batch: &EventsBatch) -> std::result::Result<(), DeliveryError>;

    /// Fire-and-forget delivery for page teardown: queue the request and
    /// return without waiting for it. Returns false if nothing was queued.
    fn send_sync(&self, batch: &EventsBatch) -> bool;

    /// Probe used while the circuit is open.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Posts batches as JSON over HTTP, with an optional bearer token.
pub struct HttpDestination {
    name: String,
    url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpDestination {
    pub fn new(config: &DestinationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("destination {}: {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            api_key: config.api_key.as_ref().map(secrets::duplicate),
            timeout: config.timeout,
            client,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(self.name.clone())
        } else {
            DeliveryError::Transport {
                destination: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }

    fn send_detached(&self, body: Vec<u8>) {
        let url = self.url.clone();
        let token = self.api_key.as_ref().map(|k| k.expose_secret().to_string());
        let timeout = self.timeout;
        let name = self.name.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut request = self
                    .client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                handle.spawn(async move {
                    if let Err(e) = request.send().await {
                        debug!(destination = %name, error = %e, "teardown send failed");
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
                        Ok(client) => client,
                        Err(e) => {
                            debug!(destination = %name, error = %e, "teardown client unavailable");
                            return;
                        }
                    };
                    let mut request = client
                        .post(url)
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(body);
                    if let Some(token) = token {
                        request = request.bearer_auth(token);
                    }
                    if let Err(e) = request.send() {
                        debug!(destination = %name, error = %e, "teardown send failed");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for HttpDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDestination")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl Destination for HttpDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &EventsBatch) -> std::result::Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(batch);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                destination: self.name.clone(),
                status: status.as_u16(),
            })
        }
    }

    fn send_sync(&self, batch: &EventsBatch) -> bool {
        match serde_json::to_vec(batch) {
            Ok(body) => {
                self.send_detached(body);
                true
            }
            Err(e) => {
                warn!(destination = %self.name, error = %e, "batch not serializable");
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .head(&self.url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(destination = %self.name, error = %e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_the_token() {
        let mut config = DestinationConfig::new("collector", "https://collector.invalid/v1/batch");
        config.api_key = Some(SecretString::from("top-secret".to_string()));
        let destination = HttpDestination::new(&config).unwrap();

        let rendered = format!("{destination:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("top-secret"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let mut config = DestinationConfig::new("local", "http://127.0.0.1:9/batch");
        config.timeout = Duration::from_secs(2);
        let destination = HttpDestination::new(&config).unwrap();
        let batch = EventsBatch {
            user_id: "u".into(),
            session_id: "s".into(),
            device: Default::default(),
            events: vec![],
            global_metadata: None,
        };

        let err = destination.send(&batch).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Transport { .. } | DeliveryError::Timeout(_)
        ));
    }
}
