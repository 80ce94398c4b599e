use std::sync::Arc;
use std::time::Duration;

use cash_register::{CashRegister, PayoutOutcome};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Periodically sends the pooled balance to the operator.
///
/// Each tick respects the payout threshold. On shutdown one last
/// threshold-respecting payout runs before the scheduler returns.
pub struct PayoutScheduler {
    register: Arc<dyn CashRegister>,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl PayoutScheduler {
    pub fn new(
        register: Arc<dyn CashRegister>,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            register,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "payout scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.payout().await,

                _ = self.shutdown_rx.recv() => {
                    info!("shutdown signal received; running final payout");
                    self.payout().await;
                    return;
                }
            }
        }
    }

    async fn payout(&self) {
        match self.register.payout_owner(false).await {
            Ok(PayoutOutcome::Skipped { balance }) => {
                info!(balance, "payout skipped");
            }
            Ok(PayoutOutcome::Sent { amount }) => {
                info!(amount, "payout delivered");
            }
            Ok(PayoutOutcome::Returned { amount }) => {
                warn!(amount, "payout undelivered; proofs returned to wallet");
            }
            Ok(PayoutOutcome::Stranded { amount }) => {
                error!(amount, "payout undelivered; locked token recorded in ledger");
            }
            Err(err) => {
                error!(%err, "payout failed");
            }
        }
    }
}
