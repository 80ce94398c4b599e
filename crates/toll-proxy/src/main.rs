mod announce;
mod cli;
mod config;
mod payout;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cash_register::{CashRegister, HttpMint, ProofWallet, Register};
use ledger::{LedgerEntry, LedgerEvent, LedgerSink};
use nostr_link::{npub, MemoryStore, RelayDmPublisher, RelayPool};
use outbound::{OutboundNetwork, PubkeyResolver};
use ws_proxy::{Proxy, ProxyConfig, Switchboard, SwitchboardConfig};

use crate::cli::Cli;
use crate::payout::PayoutScheduler;

/// Discovery events kept locally for pubkey resolution.
const DISCOVERY_CACHE_SIZE: usize = 10_000;

/// How long to wait on the final payout after the proxy stops.
const FINAL_PAYOUT_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args and environment.
    let cli = Cli::parse();

    // 2. Load config, then merge overrides.
    let mut cfg = config::load(&cli.config)?;
    cli.apply(&mut cfg);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    config::warn_unsupported(|name| std::env::var_os(name).is_some());

    // 4. Fail fast on incomplete configuration.
    let settings = cfg.validate().context("invalid configuration")?;

    info!(
        config_file = %cli.config.display(),
        listen = %settings.listen_addr,
        price = settings.prices.price,
        per = settings.prices.metering.as_str(),
        mint = %settings.mint_url,
        npub = %npub(&settings.keys.public_key()),
        static_upstream = ?settings.static_upstream,
        "toll-proxy starting"
    );

    // 5. Start the ledger.
    let (ledger, ledger_handle) = LedgerSink::start(&settings.ledger_path)
        .await
        .context("failed to start ledger")?;

    ledger
        .log(LedgerEntry::new(
            LedgerEvent::ProcessStarted,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "pubkey": settings.keys.public_key().to_hex(),
            }),
        ))
        .await;

    // 6. Payments: mint client, wallet, payout delivery.
    let relays = RelayPool::connect(settings.relays.clone())
        .await
        .context("failed to set up relay pool")?;
    let mint = Arc::new(HttpMint::new(settings.mint_url.clone()));
    let wallet = Arc::new(ProofWallet::new(mint, settings.keys.clone(), settings.unit.clone()));
    let publisher = Arc::new(RelayDmPublisher::new(settings.keys.clone(), relays.clone()));
    let register: Arc<dyn CashRegister> = Arc::new(
        Register::new(wallet, publisher, settings.prices, settings.payout.clone())
            .with_ledger(ledger.clone()),
    );

    // 7. Outbound routing and pubkey resolution.
    let network = OutboundNetwork::new(settings.proxies.clone());
    info!(pac = %network.pac_script(), "outbound routing");
    let resolver = PubkeyResolver::new(
        Arc::new(relays.clone()),
        Arc::new(MemoryStore::new(DISCOVERY_CACHE_SIZE)),
    );

    let switchboard = Switchboard::new(
        SwitchboardConfig {
            static_upstream: settings.static_upstream.clone(),
            max_buffered_frames: settings.max_buffered_frames,
            ..SwitchboardConfig::default()
        },
        Arc::new(resolver),
        Arc::new(network),
    )
    .with_register(Arc::clone(&register))
    .with_ledger(ledger.clone());

    // 8. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 9. Payout scheduler, only with a recipient.
    let payout_task = settings.payout.pubkey.map(|recipient| {
        info!(
            recipient = %recipient,
            threshold = settings.payout.threshold,
            interval_secs = settings.payout_interval.as_secs(),
            "operator payouts enabled"
        );
        tokio::spawn(
            PayoutScheduler::new(
                Arc::clone(&register),
                settings.payout_interval,
                shutdown_tx.subscribe(),
            )
            .run(),
        )
    });

    // 10. Advertise inbound addresses.
    announce::announce(&relays, &settings.keys, &settings.advertised).await;

    // 11. Bind and serve until shutdown.
    let proxy = Proxy::bind(
        ProxyConfig {
            listen_addr: settings.listen_addr,
            ledger: ledger.clone(),
        },
        Arc::new(switchboard),
    )
    .await
    .context("failed to bind listener")?;

    let mut shutdown_rx = shutdown_tx.subscribe();
    let proxy_result = tokio::select! {
        r = proxy.run() => {
            info!("WebSocket proxy exited");
            let _ = shutdown_tx.send(());
            r
        }
        _ = shutdown_rx.recv() => Ok(()),
    };

    if let Some(task) = payout_task {
        if tokio::time::timeout(FINAL_PAYOUT_GRACE, task).await.is_err() {
            tracing::warn!("final payout did not finish in time");
        }
    }

    // 12. Log shutdown.
    info!("toll-proxy shutting down");

    ledger
        .log(LedgerEntry::new(
            LedgerEvent::ProcessStopped,
            serde_json::json!({
                "proxy_result": format!("{:?}", proxy_result),
            }),
        ))
        .await;

    // 13. Drain the ledger. Connection tasks may still hold sink clones.
    drop(ledger);
    let written = ledger_handle.shutdown().await;
    info!(entries = written, "ledger closed");

    proxy_result
}
