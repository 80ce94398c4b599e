use thiserror::Error;

/// An address that cannot be dialed at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("url '{0}' has no host")]
    MissingHost(String),

    #[error("unsupported scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),

    #[error("unknown network '{0}'")]
    UnknownNetwork(String),
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("no {transport} proxy configured for {host}")]
    TransportUnavailable { transport: String, host: String },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socks5 proxy refused the connection (reply {reply:#04x})")]
    SocksRefused { reply: u8 },

    #[error("socks5 protocol error: {0}")]
    SocksProtocol(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("'{0}' is not a hex public key")]
    InvalidPubkey(String),

    #[error("no reachable address advertised for {0}")]
    NoUsableAddress(String),
}
