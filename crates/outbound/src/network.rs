use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{AddressError, DialError};
use crate::socks;
use crate::transport::{Capabilities, Transport};

/// A dialed upstream WebSocket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// SOCKS5 endpoints for the overlay networks, as `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEndpoints {
    pub tor: Option<String>,
    pub i2p: Option<String>,
}

/// How a connection to one host leaves this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchRule {
    Direct,
    Socks5(String),
}

/// Opens upstream WebSockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn dial(&self, url: &str) -> Result<WsStream, DialError>;
}

/// Direct dialing plus SOCKS5 routing for `.onion` and `.i2p` hosts.
#[derive(Debug, Clone)]
pub struct OutboundNetwork {
    proxies: ProxyEndpoints,
    dial_timeout: Duration,
}

impl OutboundNetwork {
    pub fn new(proxies: ProxyEndpoints) -> Self {
        if let Some(tor) = &proxies.tor {
            info!(proxy = %tor, "tor connections enabled");
        }
        if let Some(i2p) = &proxies.i2p {
            info!(proxy = %i2p, "i2p connections enabled");
        }
        Self {
            proxies,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// The proxy-auto-config decision for `host`.
    pub fn rule_for(&self, host: &str) -> DispatchRule {
        let proxy = match Transport::of_host(host) {
            Transport::I2p => self.proxies.i2p.as_ref(),
            Transport::Tor => self.proxies.tor.as_ref(),
            Transport::Clearnet | Transport::Hyper => None,
        };
        match proxy {
            Some(addr) => DispatchRule::Socks5(addr.clone()),
            None => DispatchRule::Direct,
        }
    }

    /// The routing table rendered as a PAC file.
    pub fn pac_script(&self) -> String {
        let mut statements = Vec::new();
        if let Some(i2p) = &self.proxies.i2p {
            statements.push(format!(
                "if (shExpMatch(host, \"*.i2p\"))\n{{\nreturn \"SOCKS5 {i2p}\";\n}}"
            ));
        }
        if let Some(tor) = &self.proxies.tor {
            statements.push(format!(
                "if (shExpMatch(host, \"*.onion\"))\n{{\nreturn \"SOCKS5 {tor}\";\n}}"
            ));
        }
        statements.push("return \"DIRECT\";".to_string());
        format!(
            "function FindProxyForURL(url, host)\n{{\n{}\n}}",
            statements.join("\n")
        )
    }

    pub fn filter_addresses<S: AsRef<str>>(&self, urls: &[S]) -> Vec<String> {
        self.capabilities().filter_addresses(urls)
    }

    pub fn first_preferred_address<'a>(
        &self,
        candidates: &'a BTreeMap<Transport, String>,
        order: &[Transport],
    ) -> Option<&'a str> {
        self.capabilities().first_preferred_address(candidates, order)
    }

    async fn open_stream(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let stream = match self.rule_for(host) {
            DispatchRule::Direct => {
                let target = format!("{host}:{port}");
                debug!(%target, "dialing direct");
                TcpStream::connect((host.trim_start_matches('[').trim_end_matches(']'), port))
                    .await
                    .map_err(|source| DialError::Connect { addr: target, source })?
            }
            DispatchRule::Socks5(proxy) => {
                debug!(%host, port, %proxy, "dialing through socks5");
                let mut stream = TcpStream::connect(proxy.as_str())
                    .await
                    .map_err(|source| DialError::Connect { addr: proxy.clone(), source })?;
                socks::connect(&mut stream, host, port).await?;
                stream
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

fn parse_target(address: &str) -> Result<(String, u16), AddressError> {
    let url = Url::parse(address).map_err(|_| AddressError::InvalidUrl(address.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(AddressError::UnsupportedScheme(other.to_string())),
    }
    let host = url
        .host_str()
        .ok_or_else(|| AddressError::MissingHost(address.to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((host, port))
}

#[async_trait]
impl Dialer for OutboundNetwork {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            clearnet: true,
            tor: self.proxies.tor.is_some(),
            i2p: self.proxies.i2p.is_some(),
        }
    }

    async fn dial(&self, address: &str) -> Result<WsStream, DialError> {
        let (host, port) = parse_target(address)?;
        let transport = Transport::of_host(&host);
        if !self.capabilities().supports(transport) {
            return Err(DialError::TransportUnavailable {
                transport: transport.to_string(),
                host,
            });
        }

        let connect = async {
            let stream = self.open_stream(&host, port).await?;
            let (socket, _response) = client_async_tls_with_config(address, stream, None, None).await?;
            Ok::<_, DialError>(socket)
        };
        tokio::time::timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| DialError::Timeout(self.dial_timeout))?
    }
}
