use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cash_register::testing::{FakeMint, RecordingPublisher};
use cash_register::{CashRegister, CurrencyUnit, Metering, PayoutPolicy, PriceList, ProofWallet, Proofs, Register};
use futures_util::{SinkExt, StreamExt};
use ledger::LedgerSink;
use nostr_link::{sign_event, Event, Keys, Kind};
use outbound::{
    Capabilities, DialError, Dialer, OutboundNetwork, ProxyEndpoints, Resolve, ResolutionError, Transport, WsStream,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use ws_proxy::{Proxy, ProxyConfig, Switchboard, SwitchboardConfig};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const MINT_URL: &str = "https://mint.test";
const STEP: Duration = Duration::from_secs(5);

// ------------------------------------------------------------------
// Fixtures
// ------------------------------------------------------------------

struct MapResolver(BTreeMap<Transport, String>);

#[async_trait]
impl Resolve for MapResolver {
    async fn lookup(&self, _pubkey: &str) -> Result<BTreeMap<Transport, String>, ResolutionError> {
        Ok(self.0.clone())
    }
}

struct CountingDialer {
    inner: OutboundNetwork,
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn dial(&self, url: &str) -> Result<WsStream, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(url).await
    }
}

/// A single-connection relay that reports every data frame it receives and
/// optionally echoes it back. The channel closes when the proxy disconnects.
async fn spawn_upstream(echo: bool) -> (String, mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(message)) = ws.next().await {
            if !(message.is_text() || message.is_binary()) {
                continue;
            }
            let _ = tx.send(message.clone());
            if echo && ws.send(message).await.is_err() {
                break;
            }
        }
    });
    (format!("ws://{addr}"), rx)
}

struct Harness {
    addr: SocketAddr,
    mint: Arc<FakeMint>,
    dialer: Arc<CountingDialer>,
}

struct Options {
    paid: bool,
    price: u64,
    metering: Metering,
    static_upstream: Option<String>,
    resolved: BTreeMap<Transport, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            paid: true,
            price: 1,
            metering: Metering::PerKib,
            static_upstream: None,
            resolved: BTreeMap::new(),
        }
    }
}

async fn start(options: Options) -> Harness {
    let mint = Arc::new(FakeMint::new(MINT_URL));
    let dialer = Arc::new(CountingDialer {
        inner: OutboundNetwork::new(ProxyEndpoints::default()).with_dial_timeout(STEP),
        dials: AtomicUsize::new(0),
    });

    let mut switchboard = Switchboard::new(
        SwitchboardConfig {
            static_upstream: options.static_upstream,
            max_buffered_frames: 16,
            ..SwitchboardConfig::default()
        },
        Arc::new(MapResolver(options.resolved)),
        dialer.clone(),
    );
    if options.paid {
        let wallet = Arc::new(ProofWallet::new(mint.clone(), Keys::generate(), CurrencyUnit::Sat));
        let register = Register::new(
            wallet,
            Arc::new(RecordingPublisher::new()),
            PriceList {
                price: options.price,
                metering: options.metering,
            },
            PayoutPolicy::default(),
        );
        switchboard = switchboard.with_register(Arc::new(register) as Arc<dyn CashRegister>);
    }

    let proxy = Proxy::bind(
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ledger: LedgerSink::disabled(),
        },
        Arc::new(switchboard),
    )
    .await
    .unwrap();
    let addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run());

    Harness { addr, mint, dialer }
}

impl Harness {
    async fn client(&self) -> Client {
        connect_async(format!("ws://{}", self.addr)).await.unwrap().0
    }

    fn dials(&self) -> usize {
        self.dialer.dials.load(Ordering::SeqCst)
    }

    fn proofs(&self, amount: u64) -> Value {
        serde_json::to_value(self.mint.issue(amount)).unwrap()
    }
}

/// An AUTH event from a throwaway key carrying `content`.
fn auth_event(content: &str) -> Event {
    sign_event(&Keys::generate(), Kind::Authentication, vec![], content, 1).unwrap()
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next data or close frame from the proxy.
async fn next(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(STEP, client.next())
            .await
            .expect("timed out waiting for the proxy")
            .expect("connection ended")
            .expect("read error");
        if !(message.is_ping() || message.is_pong()) {
            return message;
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    match next(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn expect_connected(client: &mut Client) {
    assert_eq!(next_json(client).await, json!(["PROXY", "CONNECTING"]));
    assert_eq!(next_json(client).await, json!(["PROXY", "CONNECTED"]));
}

async fn expect_close(client: &mut Client) -> Option<(CloseCode, String)> {
    loop {
        match tokio::time::timeout(STEP, client.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| (f.code, f.reason.as_str().to_string())),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut frames = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(STEP, rx.recv()).await {
        frames.push(message);
    }
    frames
}

// ------------------------------------------------------------------
// Scenarios
// ------------------------------------------------------------------

#[tokio::test]
async fn unpaid_request_gets_payment_required() {
    let harness = start(Options {
        price: 2,
        ..Options::default()
    })
    .await;
    let (upstream, _rx) = spawn_upstream(true).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", upstream])).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply[0], "PROXY");
    assert_eq!(reply[1], "PAYMENT_REQUIRED");
    assert_eq!(reply[2]["price"], 2);
    assert_eq!(reply[2]["mint"], MINT_URL);
    assert_eq!(reply[2]["unit"], "sat");
    assert_eq!(reply[2]["per"], "kib");
    assert_eq!(harness.dials(), 0);
}

#[tokio::test]
async fn buffered_frames_replay_in_order_once() {
    let harness = start(Options::default()).await;
    let (upstream, mut rx) = spawn_upstream(false).await;
    let mut client = harness.client().await;

    for n in 0..5 {
        send(&mut client, json!(["REQ", format!("sub{n}"), {}])).await;
    }
    send(&mut client, json!(["PROXY", upstream, harness.proofs(10)])).await;
    expect_connected(&mut client).await;
    send(&mut client, json!(["CLOSE", "sub0"])).await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        let message = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
        seen.push(serde_json::from_str::<Value>(message.to_text().unwrap()).unwrap());
    }
    let expected: Vec<Value> = (0..5)
        .map(|n| json!(["REQ", format!("sub{n}"), {}]))
        .chain(std::iter::once(json!(["CLOSE", "sub0"])))
        .collect();
    assert_eq!(seen, expected);

    drop(client);
    assert!(drain(&mut rx).await.is_empty());
}

#[tokio::test]
async fn byte_allowance_cuts_off_after_exact_budget() {
    // 10 sats at 1 sat/KiB buys 10 KiB.
    let harness = start(Options::default()).await;
    let (upstream, mut rx) = spawn_upstream(false).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", upstream, harness.proofs(10)])).await;
    expect_connected(&mut client).await;

    for _ in 0..11 {
        if client.send(Message::Binary(vec![7u8; 1024].into())).await.is_err() {
            break;
        }
    }

    let (code, reason) = expect_close(&mut client).await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "allowance exhausted");

    let forwarded = drain(&mut rx).await;
    assert_eq!(forwarded.len(), 10);
    assert_eq!(forwarded.iter().map(Message::len).sum::<usize>(), 10 * 1024);
}

#[tokio::test]
async fn downstream_traffic_is_metered_too() {
    let harness = start(Options::default()).await;
    let (upstream, _rx) = spawn_upstream(true).await;
    let mut client = harness.client().await;

    // 1 KiB each way fits exactly in a 2 KiB allowance.
    send(&mut client, json!(["PROXY", upstream, harness.proofs(2)])).await;
    expect_connected(&mut client).await;

    client.send(Message::Binary(vec![1u8; 1024].into())).await.unwrap();
    assert_eq!(next(&mut client).await.len(), 1024);

    client.send(Message::Binary(vec![1u8; 1].into())).await.unwrap();
    let (code, _) = expect_close(&mut client).await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
}

#[tokio::test]
async fn unknown_pubkey_is_an_error_without_dialing() {
    let harness = start(Options::default()).await;
    let mut client = harness.client().await;

    let pubkey = Keys::generate().public_key().to_hex();
    send(&mut client, json!(["PROXY", pubkey, harness.proofs(10)])).await;

    let reply = next_json(&mut client).await;
    assert_eq!(reply[0], "PROXY");
    assert_eq!(reply[1], "ERROR");
    expect_close(&mut client).await;
    assert_eq!(harness.dials(), 0);
}

#[tokio::test]
async fn pubkey_target_uses_preferred_address() {
    let (upstream, mut rx) = spawn_upstream(false).await;
    let mut resolved = BTreeMap::new();
    resolved.insert(Transport::Clearnet, upstream);
    resolved.insert(Transport::Tor, "ws://unreachable.onion".to_string());
    let harness = start(Options {
        resolved,
        ..Options::default()
    })
    .await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", Keys::generate().public_key().to_hex(), harness.proofs(4)])).await;
    expect_connected(&mut client).await;
    send(&mut client, json!(["REQ", "s", {}])).await;
    assert!(tokio::time::timeout(STEP, rx.recv()).await.unwrap().is_some());
    assert_eq!(harness.dials(), 1);
}

#[tokio::test]
async fn failed_payment_keeps_waiting_for_auth() {
    let harness = start(Options::default()).await;
    let (upstream, mut rx) = spawn_upstream(false).await;
    let mut client = harness.client().await;

    // Spend the proofs elsewhere first.
    let proofs: Proofs = harness.mint.issue(8);
    let spender = ProofWallet::new(harness.mint.clone(), Keys::generate(), CurrencyUnit::Sat);
    cash_register::Wallet::add(&spender, proofs.clone()).await.unwrap();

    send(&mut client, json!(["PROXY", upstream, proofs])).await;
    assert_eq!(next_json(&mut client).await, json!(["PROXY", "ERROR", "payment failed"]));

    send(&mut client, json!(["REQ", "early", {}])).await;

    let auth = auth_event(&harness.mint.issue_token(8));
    send(&mut client, json!(["AUTH", auth])).await;

    assert_eq!(next_json(&mut client).await, json!(["OK", auth.id.to_hex(), true, ""]));
    expect_connected(&mut client).await;

    let first = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.to_text().unwrap(), json!(["REQ", "early", {}]).to_string());
}

#[tokio::test]
async fn forged_auth_is_refused() {
    let harness = start(Options::default()).await;
    let mut client = harness.client().await;

    let mut auth = serde_json::to_value(auth_event(&harness.mint.issue_token(8))).unwrap();
    auth["content"] = json!(harness.mint.issue_token(9));
    send(&mut client, json!(["AUTH", auth])).await;

    let reply = next_json(&mut client).await;
    assert_eq!(reply[0], "OK");
    assert_eq!(reply[2], false);
}

#[tokio::test]
async fn bad_token_in_auth_reports_payment_failed() {
    let harness = start(Options::default()).await;
    let mut client = harness.client().await;

    let auth = auth_event("cashuAnonsense");
    send(&mut client, json!(["AUTH", auth])).await;
    assert_eq!(
        next_json(&mut client).await,
        json!(["OK", auth.id.to_hex(), false, "payment failed"])
    );
}

#[tokio::test]
async fn malformed_control_frame_does_not_close() {
    let harness = start(Options::default()).await;
    let (upstream, _rx) = spawn_upstream(false).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", "ftp://nope"])).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply[1], "ERROR");

    send(&mut client, json!(["PROXY", upstream, harness.proofs(4)])).await;
    expect_connected(&mut client).await;
}

#[tokio::test]
async fn rebinding_closes_the_first_upstream() {
    let harness = start(Options::default()).await;
    let (first, mut first_rx) = spawn_upstream(false).await;
    let (second, mut second_rx) = spawn_upstream(false).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", first, harness.proofs(10)])).await;
    expect_connected(&mut client).await;
    send(&mut client, json!(["REQ", "a", {}])).await;
    assert!(tokio::time::timeout(STEP, first_rx.recv()).await.unwrap().is_some());

    // Remaining allowance carries over; no new payment needed.
    send(&mut client, json!(["PROXY", second])).await;
    expect_connected(&mut client).await;
    send(&mut client, json!(["REQ", "b", {}])).await;

    let got = tokio::time::timeout(STEP, second_rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.to_text().unwrap(), json!(["REQ", "b", {}]).to_string());
    assert!(drain(&mut first_rx).await.is_empty());
    assert_eq!(harness.dials(), 2);
}

#[tokio::test]
async fn static_upstream_needs_no_payment() {
    let (upstream, mut rx) = spawn_upstream(true).await;
    let harness = start(Options {
        static_upstream: Some(upstream),
        ..Options::default()
    })
    .await;
    let mut client = harness.client().await;

    send(&mut client, json!(["REQ", "s", {}])).await;
    let echoed = next_json(&mut client).await;
    assert_eq!(echoed, json!(["REQ", "s", {}]));
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn free_mode_connects_without_payment() {
    let harness = start(Options {
        paid: false,
        ..Options::default()
    })
    .await;
    let (upstream, _rx) = spawn_upstream(true).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", upstream])).await;
    expect_connected(&mut client).await;
    send(&mut client, json!(["REQ", "s", {}])).await;
    assert_eq!(next_json(&mut client).await, json!(["REQ", "s", {}]));
}

#[tokio::test]
async fn time_allowance_expires() {
    // 1 sat at 60 sats/minute buys one second.
    let harness = start(Options {
        price: 60,
        metering: Metering::PerMinute,
        ..Options::default()
    })
    .await;
    let (upstream, _rx) = spawn_upstream(true).await;
    let mut client = harness.client().await;

    send(&mut client, json!(["PROXY", upstream, harness.proofs(1)])).await;
    expect_connected(&mut client).await;

    let (code, reason) = expect_close(&mut client).await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "allowance exhausted");
}

#[tokio::test]
async fn unreachable_upstream_closes_with_error() {
    let harness = start(Options::default()).await;
    let mut client = harness.client().await;

    // Bound then dropped: nothing listens here.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    send(&mut client, json!(["PROXY", format!("ws://{addr}"), harness.proofs(3)])).await;

    assert_eq!(next_json(&mut client).await, json!(["PROXY", "CONNECTING"]));
    assert_eq!(next_json(&mut client).await[1], "ERROR");
    let (code, _) = expect_close(&mut client).await.expect("close frame");
    assert_eq!(code, CloseCode::Error);
}

#[tokio::test]
async fn too_many_frames_before_proxy_closes_with_size() {
    let harness = start(Options::default()).await;
    let mut client = harness.client().await;

    // The harness allows 16 buffered frames; the 17th overflows.
    for n in 0..17 {
        send(&mut client, json!(["REQ", format!("sub{n}"), {}])).await;
    }

    assert_eq!(
        next_json(&mut client).await,
        json!(["PROXY", "ERROR", "too many frames before upstream connected"])
    );
    let (code, reason) = expect_close(&mut client).await.expect("close frame");
    assert_eq!(code, CloseCode::Size);
    assert_eq!(reason, "buffer overflow");
    assert_eq!(harness.dials(), 0);
}
