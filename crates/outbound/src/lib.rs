//! # outbound
//!
//! Everything the proxy needs to reach an upstream relay.
//!
//! - [`Transport`] classifies addresses (clearnet, hyper, Tor, I2P).
//! - [`OutboundNetwork`] knows which transports are configured, picks a
//!   [`DispatchRule`] per host (direct, or SOCKS5 through the Tor/I2P
//!   proxy) and dials WebSocket upstreams through it.
//! - [`PubkeyResolver`] turns a relay operator's public key into the
//!   addresses it advertises in discovery events.
//!
//! ```rust,no_run
//! use outbound::{Dialer, OutboundNetwork, ProxyEndpoints};
//!
//! # async fn example() -> Result<(), outbound::DialError> {
//! let network = OutboundNetwork::new(ProxyEndpoints {
//!     tor: Some("127.0.0.1:9050".into()),
//!     i2p: None,
//! });
//! let upstream = network.dial("ws://exampleonionaddress.onion").await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod network;
mod resolver;
mod socks;
mod transport;

pub use error::{AddressError, DialError, ResolutionError};
pub use network::{Dialer, DispatchRule, OutboundNetwork, ProxyEndpoints, WsStream};
pub use resolver::{PubkeyResolver, Resolve, DEFAULT_TTL};
pub use transport::{Capabilities, Transport, PREFERENCE_ORDER};
