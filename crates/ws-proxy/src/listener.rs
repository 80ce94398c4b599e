use std::net::SocketAddr;
use std::sync::Arc;

use ledger::{ConnectionRef, LedgerEntry, LedgerEvent, LedgerSink};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};

use crate::switchboard::Switchboard;

/// Configuration for the listening side of the proxy.
pub struct ProxyConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Ledger for connection open/close records.
    pub ledger: LedgerSink,
}

/// The WebSocket reverse proxy server.
///
/// Accepts client WebSocket connections and hands each one to the
/// [`Switchboard`] in its own task.
pub struct Proxy {
    listener: TcpListener,
    ledger: LedgerSink,
    switchboard: Arc<Switchboard>,
}

impl Proxy {
    /// Bind the listening socket.
    pub async fn bind(config: ProxyConfig, switchboard: Arc<Switchboard>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            ledger: config.ledger,
            switchboard,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the proxy server.
    ///
    /// Loops forever accepting connections. Each connection is handled in
    /// its own Tokio task.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "ws-proxy listening");

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let switchboard = Arc::clone(&self.switchboard);
            let ledger = self.ledger.clone();

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, switchboard, ledger).await {
                    tracing::debug!(%remote_addr, %err, "connection handler error");
                }
            });
        }
    }
}

/// Handle a single TCP connection from accept through the switchboard and
/// teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    switchboard: Arc<Switchboard>,
    ledger: LedgerSink,
) -> anyhow::Result<()> {
    let connection_id = uuid::Uuid::new_v4();
    let _ = stream.set_nodelay(true);

    // ------------------------------------------------------------------
    // 1. Accept the WebSocket handshake, capturing X-Forwarded-For via
    //    the callback.
    // ------------------------------------------------------------------
    let forwarded_for: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
    let forwarded_for_cb = Arc::clone(&forwarded_for);

    let callback = move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
        let value = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Ok(mut guard) = forwarded_for_cb.lock() {
            *guard = value;
        }
        Ok(response)
    };

    let client_ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let client_addr = forwarded_for
        .lock()
        .ok()
        .and_then(|g| g.clone())
        .unwrap_or_else(|| remote_addr.to_string());

    tracing::info!(%connection_id, %remote_addr, client = %client_addr, "client connected");

    let peer = ConnectionRef::new(connection_id, client_addr);
    ledger
        .log(
            LedgerEntry::new(
                LedgerEvent::ConnectionOpened,
                serde_json::json!({ "socket_addr": remote_addr.to_string() }),
            )
            .with_connection(peer.clone()),
        )
        .await;

    // ------------------------------------------------------------------
    // 2. Run the proxy protocol until either side goes away.
    // ------------------------------------------------------------------
    let reason = switchboard.handle_connection(client_ws, peer.clone()).await;

    tracing::info!(%connection_id, %remote_addr, %reason, "connection closed");

    ledger
        .log(
            LedgerEntry::new(
                LedgerEvent::ConnectionClosed,
                serde_json::json!({ "reason": reason.as_str() }),
            )
            .with_connection(peer),
        )
        .await;

    Ok(())
}
