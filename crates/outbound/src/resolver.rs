use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr_link::{
    discovery_kind, is_pubkey_hex, parse_public_key, EventSource, EventStore, Filter, PublicKey, TagLookup,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResolutionError;
use crate::transport::Transport;

/// How long a relay query for one pubkey stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Maps a public key to the addresses it advertises.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Newest advertised address per transport. Empty when nothing is known.
    async fn lookup(&self, pubkey: &str) -> Result<BTreeMap<Transport, String>, ResolutionError>;
}

/// When a pubkey was last refreshed from relays. Held across the relay
/// query, so concurrent lookups of one pubkey wait for a single refresh.
type RefreshSlot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Resolves through discovery events (kind 30166), cached in an
/// [`EventStore`] and refreshed from relays at most once per TTL.
pub struct PubkeyResolver {
    source: Arc<dyn EventSource>,
    store: Arc<dyn EventStore>,
    ttl: Duration,
    refreshed: Mutex<HashMap<String, RefreshSlot>>,
}

impl PubkeyResolver {
    pub fn new(source: Arc<dyn EventSource>, store: Arc<dyn EventStore>) -> Self {
        Self {
            source,
            store,
            ttl: DEFAULT_TTL,
            refreshed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn slot(&self, pubkey: &str) -> RefreshSlot {
        let mut slots = self.refreshed.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(pubkey.to_string()).or_default())
    }

    /// Query relays for `pubkey` unless a refresh finished within the TTL.
    /// A lookup arriving while another is querying waits for it and then
    /// reuses its result.
    async fn refresh(&self, pubkey: &str, filter: &Filter) {
        let slot = self.slot(pubkey);
        let mut last = slot.lock().await;
        if last.is_some_and(|at| at.elapsed() < self.ttl) {
            return;
        }

        match self.source.query(filter).await {
            Ok(events) => {
                debug!(%pubkey, count = events.len(), "discovery events fetched");
                for event in events {
                    self.store.insert(event).await;
                }
                *last = Some(Instant::now());
            }
            // The stamp stays unset so the next lookup tries again.
            Err(err) => warn!(%pubkey, error = %err, "discovery refresh failed, using cache"),
        }
    }
}

fn discovery_filter(pubkey: PublicKey) -> Filter {
    Filter::new()
        .author(pubkey)
        .pubkey(pubkey)
        .kind(discovery_kind())
}

#[async_trait]
impl Resolve for PubkeyResolver {
    async fn lookup(&self, pubkey: &str) -> Result<BTreeMap<Transport, String>, ResolutionError> {
        let pubkey = pubkey.to_ascii_lowercase();
        if !is_pubkey_hex(&pubkey) {
            return Err(ResolutionError::InvalidPubkey(pubkey));
        }
        let key = parse_public_key(&pubkey).map_err(|_| ResolutionError::InvalidPubkey(pubkey.clone()))?;
        let filter = discovery_filter(key);

        self.refresh(&pubkey, &filter).await;

        let mut addresses = BTreeMap::new();
        for event in self.store.query(&filter).await {
            let Some(address) = event.tag_value("d") else {
                continue;
            };
            let transport = match event.tag_value("n").map(str::parse::<Transport>) {
                Some(Ok(transport)) => transport,
                _ => match Transport::of_url(address) {
                    Ok(transport) => transport,
                    Err(_) => continue,
                },
            };
            // Store results are newest first.
            addresses
                .entry(transport)
                .or_insert_with(|| address.to_string());
        }
        Ok(addresses)
    }
}
