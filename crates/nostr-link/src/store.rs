use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use nostr::{Event, Filter};

use crate::event::TagLookup;

/// Local event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store an event. Returns `false` if it was ignored (duplicate, or older
    /// than the stored version of a replaceable event).
    async fn insert(&self, event: Event) -> bool;

    /// Events matching `filter`, newest first.
    async fn query(&self, filter: &Filter) -> Vec<Event>;
}

/// Bounded in-memory store. The least recently touched entries are evicted
/// first once `capacity` is reached.
pub struct MemoryStore {
    events: Mutex<LruCache<String, Event>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            events: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn store_key(event: &Event) -> String {
    if event.is_parameterized_replaceable() {
        format!(
            "{}:{}:{}",
            event.kind.as_u16(),
            event.pubkey.to_hex(),
            event.tag_value("d").unwrap_or_default()
        )
    } else {
        event.id.to_hex()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, event: Event) -> bool {
        let Ok(mut events) = self.events.lock() else {
            return false;
        };
        let key = store_key(&event);
        let stale = events.peek(&key).is_some_and(|existing| {
            existing.id == event.id || existing.created_at > event.created_at
        });
        if stale {
            return false;
        }
        events.put(key, event);
        true
    }

    async fn query(&self, filter: &Filter) -> Vec<Event> {
        let Ok(events) = self.events.lock() else {
            return Vec::new();
        };
        let mut matched: Vec<Event> = events
            .iter()
            .map(|(_, e)| e)
            .filter(|e| filter.match_event(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}
