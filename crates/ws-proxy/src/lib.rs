//! Pay-per-use WebSocket reverse proxy for Nostr relays.
//!
//! Clients connect, name a target (a relay URL or a relay operator's public
//! key) with a `PROXY` frame and pay for it in ecash. The switchboard then
//! dials the upstream, replays whatever the client sent in the meantime and
//! forwards frames both ways while the [`TrafficMeter`] or the paid deadline
//! allows.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  Switchboard  <--WS-->  Relay (clearnet / Tor / I2P)
//!                     |     |
//!          CashRegister     PubkeyResolver + OutboundNetwork
//!                     |
//!                  Ledger
//! ```
//!
//! # Protocol
//!
//! ```text
//! -> ["PROXY", "<wss://url | hex pubkey>", <proofs | token>?]
//! <- ["PROXY", "PAYMENT_REQUIRED", {"price", "mint", "unit", "per"}]
//! <- ["PROXY", "CONNECTING"]
//! <- ["PROXY", "CONNECTED"]
//! <- ["PROXY", "ERROR", "<message>"]
//! -> ["AUTH", <event whose content is a cashu token>]
//! <- ["OK", "<event id>", <accepted>, "<reason>"]
//! ```

pub mod connection;
pub mod listener;
pub mod meter;
pub mod protocol;
pub mod switchboard;

pub use connection::{CloseReason, Connection, Socket, State};
pub use listener::{Proxy, ProxyConfig};
pub use meter::{Allowance, TrafficMeter};
pub use protocol::{ClientFrame, Payment, ProtocolError, ServerFrame, Target};
pub use switchboard::{Switchboard, SwitchboardConfig, DEFAULT_MAX_BUFFERED_FRAMES};
