use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_sdk::Client;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relays configured")]
    NoRelays,

    #[error("invalid relay url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("relay request failed: {0}")]
    Request(String),

    #[error("every relay failed")]
    AllFailed,
}

/// Somewhere events can be fetched from.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, RelayError>;
}

/// A fixed set of relays behind one `nostr-sdk` client.
///
/// The client keeps a connection per relay, merges and de-duplicates query
/// results and drops events whose signatures do not verify. Queries return
/// what arrived before EOSE or the timeout.
#[derive(Debug, Clone)]
pub struct RelayPool {
    client: Client,
    relays: Vec<String>,
    timeout: Duration,
}

impl RelayPool {
    /// Register every relay and start connecting in the background.
    pub async fn connect(relays: Vec<String>) -> Result<Self, RelayError> {
        if relays.is_empty() {
            return Err(RelayError::NoRelays);
        }

        let client = Client::default();
        for url in &relays {
            client
                .add_relay(url.as_str())
                .await
                .map_err(|err| RelayError::InvalidUrl {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
        }
        client.connect().await;
        tracing::info!(relays = relays.len(), "relay pool connecting");

        Ok(Self {
            client,
            relays,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Publish `event` to every relay. Returns how many relays accepted it;
    /// fails only if none did.
    pub async fn publish(&self, event: &Event) -> Result<usize, RelayError> {
        let output = self
            .client
            .send_event(event.clone())
            .await
            .map_err(|err| RelayError::Request(err.to_string()))?;

        for (relay, reason) in &output.failed {
            tracing::warn!(%relay, ?reason, event_id = %event.id, "publish failed");
        }
        if output.success.is_empty() {
            return Err(RelayError::AllFailed);
        }
        Ok(output.success.len())
    }
}

#[async_trait]
impl EventSource for RelayPool {
    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, RelayError> {
        let events = self
            .client
            .fetch_events(filter.clone(), self.timeout)
            .await
            .map_err(|err| RelayError::Request(err.to_string()))?;
        Ok(events.into_iter().collect())
    }
}
