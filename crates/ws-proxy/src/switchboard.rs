use std::sync::Arc;

use cash_register::{CashRegister, PaymentError, PaymentRequest};
use ledger::{ConnectionRef, LedgerEntry, LedgerEvent, LedgerSink};
use nostr_link::Event;
use outbound::{Dialer, Resolve, ResolutionError, Transport, WsStream, PREFERENCE_ORDER};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, Connection, DialFuture, Forward, Socket, State, Wake};
use crate::meter::{Allowance, TrafficMeter};
use crate::protocol::{ClientFrame, Payment, ServerFrame, Target};

/// Default cap on frames held while no upstream is open.
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 1000;

#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Dial this upstream for every client, unmetered.
    pub static_upstream: Option<String>,
    pub max_buffered_frames: usize,
    /// Transport order for pubkey targets.
    pub preference: Vec<Transport>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            static_upstream: None,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            preference: PREFERENCE_ORDER.to_vec(),
        }
    }
}

/// Runs the proxy protocol for each client connection.
///
/// Without a [`CashRegister`] every target is free and unmetered.
pub struct Switchboard {
    config: SwitchboardConfig,
    register: Option<Arc<dyn CashRegister>>,
    resolver: Arc<dyn Resolve>,
    dialer: Arc<dyn Dialer>,
    ledger: LedgerSink,
}

impl Switchboard {
    pub fn new(config: SwitchboardConfig, resolver: Arc<dyn Resolve>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            register: None,
            resolver,
            dialer,
            ledger: LedgerSink::disabled(),
        }
    }

    pub fn with_register(mut self, register: Arc<dyn CashRegister>) -> Self {
        self.register = Some(register);
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerSink) -> Self {
        self.ledger = ledger;
        self
    }

    /// Drive one client connection until it closes.
    pub async fn handle_connection<S: Socket>(&self, source: S, peer: ConnectionRef) -> CloseReason {
        let mut conn: Connection<S, WsStream> = Connection::new(source, self.config.max_buffered_frames);

        if let Some(upstream) = self.config.static_upstream.clone() {
            conn.set_allowance(Allowance::Unmetered);
            self.connect(&mut conn, upstream, false).await;
        }

        loop {
            let outcome = match conn.next_wake().await {
                Wake::Source(Some(Ok(message))) => self.on_source_message(&mut conn, message, &peer).await,
                Wake::Source(Some(Err(err))) => {
                    debug!(connection_id = %peer.connection_id, %err, "client read error");
                    Some(CloseReason::SourceClosed)
                }
                Wake::Source(None) => Some(CloseReason::SourceClosed),
                Wake::Dialed(result) => self.on_dialed(&mut conn, result, &peer).await,
                Wake::Upstream(Some(Ok(message))) => self.on_upstream_message(&mut conn, message).await,
                Wake::Upstream(Some(Err(err))) => {
                    debug!(connection_id = %peer.connection_id, %err, "upstream read error");
                    Some(CloseReason::UpstreamFailed)
                }
                Wake::Upstream(None) => Some(CloseReason::UpstreamClosed),
                Wake::Deadline => Some(CloseReason::AllowanceExhausted),
            };

            if let Some(reason) = outcome {
                return self.close(&mut conn, reason, &peer).await;
            }
        }
    }

    async fn close<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        reason: CloseReason,
        peer: &ConnectionRef,
    ) -> CloseReason {
        let meter = conn.allowance().and_then(Allowance::meter).cloned();
        if reason == CloseReason::AllowanceExhausted {
            info!(
                connection_id = %peer.connection_id,
                target = ?conn.target(),
                bytes = meter.as_ref().map(TrafficMeter::total),
                "allowance exhausted"
            );
            self.ledger
                .log(
                    LedgerEntry::new(
                        LedgerEvent::AllowanceExhausted,
                        serde_json::json!({
                            "upstream_bytes": meter.as_ref().map(|m| m.upstream_total()),
                            "downstream_bytes": meter.as_ref().map(|m| m.downstream_total()),
                            "total_bytes": meter.as_ref().map(TrafficMeter::total),
                        }),
                    )
                    .with_connection(self.peer_with_target(peer, conn.target())),
                )
                .await;
        }
        conn.finish(reason).await;
        reason
    }

    fn peer_with_target(&self, peer: &ConnectionRef, target: Option<&str>) -> ConnectionRef {
        match target {
            Some(target) => peer.clone().with_target(target),
            None => peer.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Client frames
    // ------------------------------------------------------------------

    async fn on_source_message<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        message: Message,
        peer: &ConnectionRef,
    ) -> Option<CloseReason> {
        match &message {
            Message::Text(text) => match ClientFrame::parse(text.as_str()) {
                Ok(ClientFrame::Proxy { target, payment }) => {
                    return self.on_proxy_request(conn, target, payment, peer).await;
                }
                Ok(ClientFrame::Auth(event)) => {
                    return self.on_auth(conn, event, peer).await;
                }
                Ok(ClientFrame::Other) => {}
                Err(err) => {
                    debug!(connection_id = %peer.connection_id, %err, "bad control frame");
                    conn.reply(ServerFrame::Error(err.to_string())).await;
                    return None;
                }
            },
            Message::Binary(_) => {}
            Message::Close(_) => return Some(CloseReason::SourceClosed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
        }

        if conn.state() == State::Forwarding {
            return match conn.forward_upstream(message).await {
                Forward::Sent => None,
                Forward::Exhausted => Some(CloseReason::AllowanceExhausted),
                Forward::Failed => Some(CloseReason::UpstreamFailed),
            };
        }
        if !conn.buffer(message) {
            warn!(connection_id = %peer.connection_id, limit = self.config.max_buffered_frames, "buffer overflow");
            conn.reply(ServerFrame::Error("too many frames before upstream connected".into()))
                .await;
            return Some(CloseReason::BufferOverflow);
        }
        None
    }

    async fn on_proxy_request<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        target: Target,
        payment: Option<Payment>,
        peer: &ConnectionRef,
    ) -> Option<CloseReason> {
        let url = match target {
            Target::Url(url) => url,
            Target::Pubkey(pubkey) => match self.resolve(&pubkey).await {
                Ok(url) => {
                    debug!(connection_id = %peer.connection_id, %pubkey, %url, "pubkey resolved");
                    url
                }
                Err(err) => {
                    info!(connection_id = %peer.connection_id, %pubkey, %err, "target unresolvable");
                    self.ledger
                        .log(
                            LedgerEntry::new(LedgerEvent::TargetUnresolved, serde_json::json!({ "pubkey": pubkey }))
                                .with_connection(peer.clone()),
                        )
                        .await;
                    conn.reply(ServerFrame::Error(err.to_string())).await;
                    return Some(CloseReason::Unresolvable);
                }
            },
        };

        let Some(register) = &self.register else {
            conn.set_allowance(Allowance::Unmetered);
            self.connect(conn, url, true).await;
            return None;
        };

        if let Some(payment) = payment {
            let request = register.payment_request();
            let result = match payment {
                Payment::Proofs(proofs) => register.collect_payment(proofs).await,
                Payment::Token(token) => register.collect_token(&token).await,
            };
            if let Err(err) = self.record_payment(conn, &request, result, peer, &url).await {
                conn.reply(ServerFrame::Error(err.to_string())).await;
                conn.await_payment(url);
                return None;
            }
        }

        if conn.has_paid_allowance() {
            self.connect(conn, url, true).await;
        } else {
            conn.reply(ServerFrame::PaymentRequired(register.payment_request()))
                .await;
            conn.await_payment(url);
        }
        None
    }

    /// Payment riding on an `AUTH` event. Tops up the allowance and releases
    /// a target that was waiting for it.
    async fn on_auth<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        event: Event,
        peer: &ConnectionRef,
    ) -> Option<CloseReason> {
        let event_id = event.id.to_hex();
        if let Err(err) = event.verify() {
            debug!(connection_id = %peer.connection_id, %err, "AUTH event rejected");
            conn.reply(ServerFrame::Ok {
                event_id,
                accepted: false,
                reason: format!("invalid: {err}"),
            })
            .await;
            return None;
        }

        let Some(register) = &self.register else {
            conn.reply(ServerFrame::Ok {
                event_id,
                accepted: true,
                reason: String::new(),
            })
            .await;
            return None;
        };

        let request = register.payment_request();
        let result = register.collect_token(&event.content).await;
        let target = conn.target().map(str::to_string).unwrap_or_default();
        let accepted = self
            .record_payment(conn, &request, result, peer, &target)
            .await
            .is_ok();

        conn.reply(ServerFrame::Ok {
            event_id,
            accepted,
            reason: if accepted {
                String::new()
            } else {
                PaymentError::Failed.to_string()
            },
        })
        .await;

        if accepted && conn.has_paid_allowance() {
            if let Some(target) = conn.take_awaiting() {
                self.connect(conn, target, true).await;
            }
        }
        None
    }

    /// Credit a collected payment to the connection and write it to the
    /// ledger.
    async fn record_payment<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        request: &PaymentRequest,
        result: Result<u64, PaymentError>,
        peer: &ConnectionRef,
        target: &str,
    ) -> Result<u64, PaymentError> {
        let connection = self.peer_with_target(peer, Some(target).filter(|t| !t.is_empty()));
        match result {
            Ok(amount) => {
                conn.credit(amount, request.price, request.per);
                info!(connection_id = %peer.connection_id, amount, per = request.per.as_str(), "payment accepted");
                self.ledger
                    .log(
                        LedgerEntry::new(
                            LedgerEvent::PaymentCollected,
                            serde_json::json!({ "price": request.price, "per": request.per.as_str() }),
                        )
                        .with_connection(connection)
                        .with_amount(amount),
                    )
                    .await;
                Ok(amount)
            }
            Err(err) => {
                info!(connection_id = %peer.connection_id, %err, "payment rejected");
                self.ledger
                    .log(
                        LedgerEntry::new(LedgerEvent::PaymentRejected, serde_json::json!({ "error": err.to_string() }))
                            .with_connection(connection),
                    )
                    .await;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Upstream
    // ------------------------------------------------------------------

    async fn resolve(&self, pubkey: &str) -> Result<String, ResolutionError> {
        let candidates = self.resolver.lookup(pubkey).await?;
        self.dialer
            .capabilities()
            .first_preferred_address(&candidates, &self.config.preference)
            .map(str::to_string)
            .ok_or_else(|| ResolutionError::NoUsableAddress(pubkey.to_string()))
    }

    /// Rebind the connection to `url`. `announce` reports progress to the
    /// client with CONNECTING and CONNECTED.
    async fn connect<S: Socket>(&self, conn: &mut Connection<S, WsStream>, url: String, announce: bool) {
        debug!(target = %url, "dialing upstream");
        let dialer = Arc::clone(&self.dialer);
        let address = url.clone();
        let dial: DialFuture<WsStream> = Box::pin(async move { dialer.dial(&address).await });

        conn.begin_dial(url, dial, announce).await;
        if announce {
            conn.reply(ServerFrame::Connecting).await;
        }
    }

    async fn on_dialed<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        result: Result<WsStream, outbound::DialError>,
        peer: &ConnectionRef,
    ) -> Option<CloseReason> {
        let target = conn.target().unwrap_or_default().to_string();
        match result {
            Ok(upstream) => {
                info!(connection_id = %peer.connection_id, %target, buffered = conn.buffered(), "upstream connected");
                match conn.attach(upstream).await {
                    Forward::Sent => None,
                    Forward::Exhausted => Some(CloseReason::AllowanceExhausted),
                    Forward::Failed => Some(CloseReason::UpstreamFailed),
                }
            }
            Err(err) => {
                warn!(connection_id = %peer.connection_id, %target, %err, "upstream dial failed");
                self.ledger
                    .log(
                        LedgerEntry::new(LedgerEvent::UpstreamFailed, serde_json::json!({ "error": err.to_string() }))
                            .with_connection(peer.clone().with_target(target)),
                    )
                    .await;
                conn.reply(ServerFrame::Error("failed to connect to upstream".into()))
                    .await;
                Some(CloseReason::UpstreamFailed)
            }
        }
    }

    async fn on_upstream_message<S: Socket>(
        &self,
        conn: &mut Connection<S, WsStream>,
        message: Message,
    ) -> Option<CloseReason> {
        match message {
            Message::Text(_) | Message::Binary(_) => match conn.forward_downstream(message).await {
                Forward::Sent => None,
                Forward::Exhausted => Some(CloseReason::AllowanceExhausted),
                Forward::Failed => Some(CloseReason::SourceClosed),
            },
            Message::Close(_) => Some(CloseReason::UpstreamClosed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}
