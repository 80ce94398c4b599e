//! Nostr plumbing used by the toll-proxy.
//!
//! The proxy itself does not speak the relay protocol beyond forwarding
//! frames. It does, however, need three things from the Nostr network:
//!
//! * discovery events (kind 30166) advertising where a pubkey can be reached,
//!   queried through an [`EventSource`] and cached in an [`EventStore`];
//! * a way to deliver the operator's payout as an encrypted direct message
//!   ([`DmPublisher`]);
//! * signature checks on `AUTH` events presented by clients.
//!
//! Event, key, filter and NIP-04 types come from the `nostr` crate and relay
//! I/O from the `nostr-sdk` client. This crate adds the seams the proxy is
//! tested through and the discovery conventions on top.
//!
//! ```text
//!   RelayPool  --query-->  MemoryStore  <--query--  PubkeyResolver
//!       ^
//!       +--EVENT (kind 4)--  RelayDmPublisher  <--  CashRegister payout
//! ```

pub mod dm;
pub mod event;
pub mod keys;
pub mod relay;
pub mod store;

pub use dm::{encrypted_dm, DmError, DmPublisher, RelayDmPublisher};
pub use event::{discovery_kind, sign_event, tag, verified_from_value, EventError, TagLookup, KIND_DISCOVERY};
pub use keys::{is_pubkey_hex, npub, parse_public_key, KeyError};
pub use relay::{EventSource, RelayError, RelayPool};
pub use store::{EventStore, MemoryStore};

pub use nostr::{Event, Filter, Keys, Kind, PublicKey, Tag};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    nostr::Timestamp::now().as_u64()
}
