use nostr_link::{discovery_kind, sign_event, tag, Event, EventError, Keys, RelayPool, TagLookup};
use outbound::Transport;
use tracing::{info, warn};

/// One discovery event per inbound address, tagged so that a resolver
/// looking up our pubkey finds it: `d` address, `n` network, `p` self,
/// `T` service type.
pub fn discovery_events(
    keys: &Keys,
    addresses: &[(Transport, String)],
    created_at: u64,
) -> Result<Vec<Event>, EventError> {
    let pubkey = keys.public_key().to_hex();
    addresses
        .iter()
        .map(|(transport, address)| {
            let tags = vec![
                tag("d", address.as_str()),
                tag("n", transport.as_str()),
                tag("p", pubkey.as_str()),
                tag("T", "Proxy"),
            ];
            sign_event(keys, discovery_kind(), tags, "", created_at)
        })
        .collect()
}

/// Publish our inbound addresses once. Failures are logged, not fatal.
pub async fn announce(pool: &RelayPool, keys: &Keys, addresses: &[(Transport, String)]) {
    if addresses.is_empty() {
        info!("no inbound addresses configured; skipping discovery announcement");
        return;
    }

    let events = match discovery_events(keys, addresses, nostr_link::unix_now()) {
        Ok(events) => events,
        Err(err) => {
            warn!(%err, "discovery events not signed");
            return;
        }
    };
    for event in events {
        let address = event.tag_value("d").unwrap_or_default().to_string();
        match pool.publish(&event).await {
            Ok(accepted) => info!(%address, relays = accepted, "discovery event published"),
            Err(err) => warn!(%address, %err, "discovery event not published"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nostr_link::{EventSource, Filter, MemoryStore, RelayError};
    use outbound::{PubkeyResolver, Resolve};
    use std::sync::Arc;

    struct Fixed(Vec<Event>);

    #[async_trait]
    impl EventSource for Fixed {
        async fn query(&self, filter: &Filter) -> Result<Vec<Event>, RelayError> {
            Ok(self.0.iter().filter(|e| filter.match_event(e)).cloned().collect())
        }
    }

    #[test]
    fn events_are_signed_and_tagged() {
        let keys = Keys::generate();
        let events = discovery_events(&keys, &[(Transport::Tor, "ws://abc.onion".into())], 1_700_000_000).unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        event.verify().unwrap();
        assert_eq!(event.kind, discovery_kind());
        assert_eq!(event.tag_value("d"), Some("ws://abc.onion"));
        assert_eq!(event.tag_value("n"), Some("tor"));
        assert_eq!(event.tag_value("p"), Some(keys.public_key().to_hex().as_str()));
        assert_eq!(event.tag_value("T"), Some("Proxy"));
    }

    #[tokio::test]
    async fn announced_addresses_resolve() {
        let keys = Keys::generate();
        let events = discovery_events(
            &keys,
            &[
                (Transport::Clearnet, "wss://proxy.example".into()),
                (Transport::I2p, "ws://proxy.i2p".into()),
            ],
            1_700_000_000,
        )
        .unwrap();

        let resolver = PubkeyResolver::new(Arc::new(Fixed(events)), Arc::new(MemoryStore::new(16)));
        let found = resolver.lookup(&keys.public_key().to_hex()).await.unwrap();

        assert_eq!(found.get(&Transport::Clearnet).map(String::as_str), Some("wss://proxy.example"));
        assert_eq!(found.get(&Transport::I2p).map(String::as_str), Some("ws://proxy.i2p"));
    }
}
