use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use cash_register::Metering;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use outbound::DialError;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::meter::Allowance;
use crate::protocol::ServerFrame;

/// Anything that carries WebSocket messages in both directions.
pub trait Socket:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> Socket for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

pub(crate) type DialFuture<U> = Pin<Box<dyn Future<Output = Result<U, DialError>> + Send>>;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingTarget,
    AwaitingPayment,
    Connecting,
    Forwarding,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AllowanceExhausted,
    SourceClosed,
    UpstreamClosed,
    UpstreamFailed,
    Unresolvable,
    BufferOverflow,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AllowanceExhausted => "allowance exhausted",
            CloseReason::SourceClosed => "source closed",
            CloseReason::UpstreamClosed => "upstream closed",
            CloseReason::UpstreamFailed => "upstream failed",
            CloseReason::Unresolvable => "target unresolvable",
            CloseReason::BufferOverflow => "buffer overflow",
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::AllowanceExhausted | CloseReason::Unresolvable => CloseCode::Policy,
            CloseReason::SourceClosed | CloseReason::UpstreamClosed => CloseCode::Normal,
            CloseReason::UpstreamFailed => CloseCode::Error,
            CloseReason::BufferOverflow => CloseCode::Size,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pushing one frame toward a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forward {
    Sent,
    Exhausted,
    Failed,
}

/// What woke the connection up.
pub(crate) enum Wake<U> {
    Source(Option<Result<Message, WsError>>),
    Dialed(Result<U, DialError>),
    Upstream(Option<Result<Message, WsError>>),
    Deadline,
}

/// One client socket and at most one upstream socket.
///
/// Owns everything that has to be released when the client goes away: the
/// upstream, a dial in flight, the pre-connect buffer and the allowance
/// (and with it any deadline).
pub struct Connection<S, U> {
    source: S,
    upstream: Option<U>,
    pending_dial: Option<DialFuture<U>>,
    target: Option<String>,
    /// Target waiting for a payment.
    awaiting: Option<String>,
    announce: bool,
    buffer: VecDeque<Message>,
    max_buffered: usize,
    allowance: Option<Allowance>,
    state: State,
}

impl<S: Socket, U: Socket + 'static> Connection<S, U> {
    pub fn new(source: S, max_buffered: usize) -> Self {
        Self {
            source,
            upstream: None,
            pending_dial: None,
            target: None,
            awaiting: None,
            announce: false,
            buffer: VecDeque::new(),
            max_buffered,
            allowance: None,
            state: State::AwaitingTarget,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn allowance(&self) -> Option<&Allowance> {
        self.allowance.as_ref()
    }

    pub fn set_allowance(&mut self, allowance: Allowance) {
        self.allowance = Some(allowance);
    }

    /// Add paid allowance, topping up what is already there.
    pub(crate) fn credit(&mut self, amount: u64, price: u64, metering: Metering) {
        self.allowance = Some(Allowance::credit(self.allowance.take(), amount, price, metering));
    }

    pub fn has_paid_allowance(&self) -> bool {
        self.allowance.as_ref().is_some_and(Allowance::is_paid_and_live)
    }

    /// Remember `target` until a payment arrives. An existing binding keeps
    /// forwarding meanwhile.
    pub(crate) fn await_payment(&mut self, target: String) {
        self.awaiting = Some(target);
        if matches!(self.state, State::AwaitingTarget) {
            self.state = State::AwaitingPayment;
        }
    }

    pub(crate) fn take_awaiting(&mut self) -> Option<String> {
        self.awaiting.take()
    }

    /// Best-effort control frame to the client.
    pub(crate) async fn reply(&mut self, frame: ServerFrame) {
        if let Err(err) = self.source.send(frame.to_message()).await {
            tracing::debug!(%err, "failed to send control frame");
        }
    }

    /// Queue a frame until the upstream opens. `false` when the buffer is
    /// full.
    pub(crate) fn buffer(&mut self, message: Message) -> bool {
        if self.buffer.len() >= self.max_buffered {
            return false;
        }
        self.buffer.push_back(message);
        true
    }

    /// Start connecting to `target`, dropping any current upstream first.
    /// `announce` sends CONNECTED once the dial succeeds.
    pub(crate) async fn begin_dial(&mut self, target: String, dial: DialFuture<U>, announce: bool) {
        self.teardown().await;
        self.target = Some(target);
        self.awaiting = None;
        self.announce = announce;
        self.pending_dial = Some(dial);
        self.state = State::Connecting;
    }

    /// Bind the dialed upstream and replay the buffer into it, in arrival
    /// order, exactly once.
    pub(crate) async fn attach(&mut self, upstream: U) -> Forward {
        self.upstream = Some(upstream);
        self.state = State::Forwarding;
        if self.announce {
            self.reply(ServerFrame::Connected).await;
        }

        while let Some(message) = self.buffer.pop_front() {
            match self.forward_upstream(message).await {
                Forward::Sent => {}
                other => {
                    self.buffer.clear();
                    return other;
                }
            }
        }
        Forward::Sent
    }

    /// Client to upstream, metered.
    pub(crate) async fn forward_upstream(&mut self, message: Message) -> Forward {
        if let Some(allowance) = self.allowance.as_mut() {
            if !allowance.admit_upstream(&message) {
                return Forward::Exhausted;
            }
        }
        let Some(upstream) = self.upstream.as_mut() else {
            return Forward::Failed;
        };
        match upstream.send(message).await {
            Ok(()) => Forward::Sent,
            Err(err) => {
                tracing::debug!(%err, "upstream write failed");
                Forward::Failed
            }
        }
    }

    /// Upstream to client, metered.
    pub(crate) async fn forward_downstream(&mut self, message: Message) -> Forward {
        if let Some(allowance) = self.allowance.as_mut() {
            if !allowance.admit_downstream(&message) {
                return Forward::Exhausted;
            }
        }
        match self.source.send(message).await {
            Ok(()) => Forward::Sent,
            Err(err) => {
                tracing::debug!(%err, "client write failed");
                Forward::Failed
            }
        }
    }

    /// Wait for the next thing that needs handling.
    pub(crate) async fn next_wake(&mut self) -> Wake<U> {
        let deadline = self.allowance.as_ref().and_then(Allowance::deadline);
        let wake = tokio::select! {
            message = self.source.next() => Wake::Source(message),
            dialed = finish_dial(&mut self.pending_dial) => Wake::Dialed(dialed),
            message = next_upstream(&mut self.upstream) => Wake::Upstream(message),
            () = sleep_until(deadline) => Wake::Deadline,
        };
        if matches!(wake, Wake::Dialed(_)) {
            self.pending_dial = None;
        }
        wake
    }

    /// Drop the upstream side: cancel a dial in flight and close the
    /// upstream socket. Safe to call any number of times.
    pub async fn teardown(&mut self) {
        self.pending_dial = None;
        if let Some(mut upstream) = self.upstream.take() {
            if let Err(err) = upstream.close().await {
                tracing::debug!(%err, "upstream close failed");
            }
        }
    }

    /// End the connection: tear down the upstream, drop the allowance and
    /// close the client with `reason`. Only the first call has any effect.
    pub async fn finish(&mut self, reason: CloseReason) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        self.teardown().await;
        self.buffer.clear();
        self.allowance = None;
        self.awaiting = None;

        if reason != CloseReason::SourceClosed {
            let frame = CloseFrame {
                code: reason.close_code(),
                reason: reason.as_str().into(),
            };
            if let Err(err) = self.source.send(Message::Close(Some(frame))).await {
                tracing::debug!(%err, "client close failed");
            }
        }
        if let Err(err) = self.source.close().await {
            tracing::debug!(%err, "client socket close failed");
        }
    }
}

async fn finish_dial<U>(pending: &mut Option<DialFuture<U>>) -> Result<U, DialError> {
    match pending {
        Some(dial) => dial.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_upstream<U: Socket>(upstream: &mut Option<U>) -> Option<Result<Message, WsError>> {
    match upstream {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
