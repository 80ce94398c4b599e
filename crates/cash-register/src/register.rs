use std::sync::Arc;

use async_trait::async_trait;
use ledger::{LedgerEntry, LedgerEvent, LedgerSink};
use nostr_link::{DmPublisher, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, PayoutError};
use crate::proof::{total_amount, Proofs};
use crate::token;
use crate::wallet::Wallet;

/// What a payment buys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metering {
    /// Bytes forwarded in either direction.
    #[default]
    #[serde(rename = "kib")]
    PerKib,
    /// Wall-clock connection time.
    #[serde(rename = "min")]
    PerMinute,
}

impl Metering {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metering::PerKib => "kib",
            Metering::PerMinute => "min",
        }
    }
}

impl std::str::FromStr for Metering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kib" | "kb" => Ok(Metering::PerKib),
            "min" | "minute" => Ok(Metering::PerMinute),
            other => Err(format!("unknown metering unit '{other}' (expected 'kib' or 'min')")),
        }
    }
}

/// Price of one metering unit, in the mint's currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceList {
    pub price: u64,
    pub metering: Metering,
}

/// Body of the `PAYMENT_REQUIRED` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub price: u64,
    pub mint: String,
    pub unit: String,
    pub per: Metering,
}

/// Where and when the pooled balance goes to the operator.
#[derive(Debug, Clone, Default)]
pub struct PayoutPolicy {
    /// No payouts happen without a recipient.
    pub pubkey: Option<PublicKey>,
    pub threshold: u64,
    /// Lock payout proofs to `pubkey` (NUT-11). Locked proofs that fail to
    /// deliver are stranded rather than returned to the wallet.
    pub lock_to_owner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutOutcome {
    /// Balance below threshold, nothing held, or no recipient configured.
    Skipped { balance: u64 },
    Sent { amount: u64 },
    /// Delivery failed and the proofs went back into the wallet.
    Returned { amount: u64 },
    /// Delivery failed for owner-locked proofs; the token is in the ledger.
    Stranded { amount: u64 },
}

/// Takes payments and pays the operator.
#[async_trait]
pub trait CashRegister: Send + Sync {
    /// Redeem `proofs`, returning the amount credited. Failures are
    /// deliberately uninformative.
    async fn collect_payment(&self, proofs: Proofs) -> Result<u64, PaymentError>;

    /// Decode a serialized token and collect its proofs.
    async fn collect_token(&self, token: &str) -> Result<u64, PaymentError>;

    fn payment_request(&self) -> PaymentRequest;

    /// Send the whole balance to the operator if it meets the threshold, or
    /// unconditionally when `ignore_threshold` is set.
    async fn payout_owner(&self, ignore_threshold: bool) -> Result<PayoutOutcome, PayoutError>;
}

pub struct Register {
    wallet: Arc<dyn Wallet>,
    publisher: Arc<dyn DmPublisher>,
    prices: PriceList,
    payout: PayoutPolicy,
    ledger: LedgerSink,
}

impl Register {
    pub fn new(
        wallet: Arc<dyn Wallet>,
        publisher: Arc<dyn DmPublisher>,
        prices: PriceList,
        payout: PayoutPolicy,
    ) -> Self {
        Self {
            wallet,
            publisher,
            prices,
            payout,
            ledger: LedgerSink::disabled(),
        }
    }

    pub fn with_ledger(mut self, ledger: LedgerSink) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }
}

fn payout_message(token: &str) -> String {
    format!(
        "Here's your profits from your relay proxying service. At {}.\n {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        token
    )
}

#[async_trait]
impl CashRegister for Register {
    async fn collect_payment(&self, proofs: Proofs) -> Result<u64, PaymentError> {
        let offered = total_amount(&proofs);
        match self.wallet.add(proofs).await {
            Ok(redemption) => {
                tracing::info!(
                    offered,
                    received = redemption.received,
                    balance = redemption.balance,
                    "payment collected"
                );
                Ok(redemption.received)
            }
            Err(err) => {
                tracing::warn!(offered, error = %err, "payment rejected");
                Err(PaymentError::Failed)
            }
        }
    }

    async fn collect_token(&self, token: &str) -> Result<u64, PaymentError> {
        let proofs = token::proofs_for_mint(token, self.wallet.mint_url(), self.wallet.unit())
            .map_err(|err| {
                tracing::debug!(error = %err, "unusable token");
                PaymentError::InvalidToken
            })?;
        self.collect_payment(proofs).await
    }

    fn payment_request(&self) -> PaymentRequest {
        PaymentRequest {
            price: self.prices.price,
            mint: self.wallet.mint_url().to_string(),
            unit: self.wallet.unit().to_string(),
            per: self.prices.metering,
        }
    }

    async fn payout_owner(&self, ignore_threshold: bool) -> Result<PayoutOutcome, PayoutError> {
        let balance = self.wallet.balance().await;
        let Some(owner) = self.payout.pubkey else {
            return Ok(PayoutOutcome::Skipped { balance });
        };
        if balance == 0 || (!ignore_threshold && balance < self.payout.threshold) {
            tracing::debug!(balance, threshold = self.payout.threshold, "payout skipped");
            return Ok(PayoutOutcome::Skipped { balance });
        }

        let lock = self.payout.lock_to_owner.then_some(&owner);
        let proofs = self.wallet.take_all(lock).await?;
        let amount = total_amount(&proofs);
        if proofs.is_empty() {
            return Ok(PayoutOutcome::Skipped { balance: 0 });
        }

        let token = token::encode(self.wallet.mint_url(), proofs.clone(), self.wallet.unit());
        let result = self.publisher.publish_dm(&owner, &payout_message(&token)).await;

        let outcome = match result {
            Ok(()) => {
                tracing::info!(amount, recipient = %owner, "payout sent");
                self.ledger
                    .log(
                        LedgerEntry::new(
                            LedgerEvent::PayoutSent,
                            serde_json::json!({ "recipient": owner.to_hex() }),
                        )
                        .with_amount(amount),
                    )
                    .await;
                PayoutOutcome::Sent { amount }
            }
            Err(err) if lock.is_some() => {
                tracing::error!(amount, error = %err, "payout delivery failed, locked token stranded");
                self.ledger
                    .log(
                        LedgerEntry::new(
                            LedgerEvent::PayoutStranded,
                            serde_json::json!({
                                "recipient": owner.to_hex(),
                                "error": err.to_string(),
                                "token": token,
                            }),
                        )
                        .with_amount(amount),
                    )
                    .await;
                PayoutOutcome::Stranded { amount }
            }
            Err(err) => {
                let balance = self.wallet.restore(proofs).await;
                tracing::warn!(amount, balance, error = %err, "payout delivery failed, proofs returned");
                self.ledger
                    .log(
                        LedgerEntry::new(
                            LedgerEvent::PayoutReturned,
                            serde_json::json!({ "error": err.to_string() }),
                        )
                        .with_amount(amount),
                    )
                    .await;
                PayoutOutcome::Returned { amount }
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMint, RecordingPublisher};
    use crate::mint::Mint;
    use crate::wallet::ProofWallet;
    use cdk::mint_url::MintUrl;
    use cdk::nuts::{CurrencyUnit, Token};
    use nostr_link::Keys;
    use std::str::FromStr;

    struct Fixture {
        mint: Arc<FakeMint>,
        publisher: Arc<RecordingPublisher>,
        register: Register,
        owner: Keys,
    }

    fn fixture(threshold: u64, lock_to_owner: bool) -> Fixture {
        let mint = Arc::new(FakeMint::new("https://mint.test"));
        let publisher = Arc::new(RecordingPublisher::new());
        let owner = Keys::generate();
        let wallet = Arc::new(ProofWallet::new(mint.clone(), Keys::generate(), CurrencyUnit::Sat));
        let register = Register::new(
            wallet,
            publisher.clone(),
            PriceList {
                price: 1,
                metering: Metering::PerKib,
            },
            PayoutPolicy {
                pubkey: Some(owner.public_key()),
                threshold,
                lock_to_owner,
            },
        );
        Fixture {
            mint,
            publisher,
            register,
            owner,
        }
    }

    fn token_in(message: &str) -> Token {
        let encoded = message.split_whitespace().last().unwrap();
        Token::from_str(encoded).unwrap()
    }

    #[tokio::test]
    async fn payment_failures_are_generic() {
        let f = fixture(25, false);
        let proofs = f.mint.issue(10);
        assert_eq!(f.register.collect_payment(proofs.clone()).await, Ok(10));
        assert_eq!(
            f.register.collect_payment(proofs).await,
            Err(PaymentError::Failed)
        );
    }

    #[tokio::test]
    async fn tokens_are_collected_for_our_mint_only() {
        let f = fixture(25, false);
        let ours = f.mint.issue_token(6);
        assert_eq!(f.register.collect_token(&ours).await, Ok(6));

        let elsewhere = MintUrl::from_str("https://elsewhere.test").unwrap();
        let theirs = token::encode(&elsewhere, f.mint.issue(6), &CurrencyUnit::Sat);
        assert_eq!(
            f.register.collect_token(&theirs).await,
            Err(PaymentError::InvalidToken)
        );
        assert_eq!(
            f.register.collect_token("not a token").await,
            Err(PaymentError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn payment_request_reflects_prices() {
        let f = fixture(25, false);
        let request = f.register.payment_request();
        assert_eq!(request.price, 1);
        assert_eq!(request.mint, "https://mint.test");
        assert_eq!(request.unit, "sat");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["per"], "kib");
    }

    #[tokio::test]
    async fn below_threshold_is_skipped_unless_forced() {
        let f = fixture(25, false);
        f.register.collect_payment(f.mint.issue(20)).await.unwrap();

        assert_eq!(
            f.register.payout_owner(false).await.unwrap(),
            PayoutOutcome::Skipped { balance: 20 }
        );
        assert!(f.publisher.sent().is_empty());

        assert_eq!(
            f.register.payout_owner(true).await.unwrap(),
            PayoutOutcome::Sent { amount: 20 }
        );
    }

    #[tokio::test]
    async fn payout_sends_whole_balance_as_token() {
        let f = fixture(25, false);
        f.register.collect_payment(f.mint.issue(30)).await.unwrap();

        let outcome = f.register.payout_owner(false).await.unwrap();
        assert_eq!(outcome, PayoutOutcome::Sent { amount: 30 });
        assert_eq!(f.register.wallet().balance().await, 0);

        let sent = f.publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, f.owner.public_key());
        assert!(sent[0].1.starts_with("Here's your profits"));
        let token = token_in(&sent[0].1);
        assert_eq!(u64::from(token.value().unwrap()), 30);
        assert_eq!(token.mint_url().unwrap(), *f.mint.url());

        // The operator can spend what they received.
        let owner_wallet = ProofWallet::new(f.mint.clone(), f.owner.clone(), CurrencyUnit::Sat);
        let proofs = token.proofs();
        assert_eq!(owner_wallet.add(proofs).await.unwrap().received, 30);
    }

    #[tokio::test]
    async fn failed_delivery_returns_proofs() {
        let f = fixture(25, false);
        f.register.collect_payment(f.mint.issue(30)).await.unwrap();
        f.publisher.set_failing(true);

        let outcome = f.register.payout_owner(false).await.unwrap();
        assert_eq!(outcome, PayoutOutcome::Returned { amount: 30 });
        assert_eq!(f.register.wallet().balance().await, 30);

        // The returned proofs are still good for the next attempt.
        f.publisher.set_failing(false);
        assert_eq!(
            f.register.payout_owner(false).await.unwrap(),
            PayoutOutcome::Sent { amount: 30 }
        );
    }

    #[tokio::test]
    async fn failed_locked_delivery_strands_proofs() {
        let f = fixture(25, true);
        f.register.collect_payment(f.mint.issue(30)).await.unwrap();
        f.publisher.set_failing(true);

        let outcome = f.register.payout_owner(false).await.unwrap();
        assert_eq!(outcome, PayoutOutcome::Stranded { amount: 30 });
        assert_eq!(f.register.wallet().balance().await, 0);
    }

    #[tokio::test]
    async fn mint_outage_leaves_balance_intact() {
        let f = fixture(25, false);
        f.register.collect_payment(f.mint.issue(30)).await.unwrap();
        f.mint.set_offline(true);

        assert!(f.register.payout_owner(false).await.is_err());
        assert_eq!(f.register.wallet().balance().await, 30);
        assert!(f.publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn no_recipient_means_no_payout() {
        let mint = Arc::new(FakeMint::new("https://mint.test"));
        let wallet = Arc::new(ProofWallet::new(mint.clone(), Keys::generate(), CurrencyUnit::Sat));
        let register = Register::new(
            wallet,
            Arc::new(RecordingPublisher::new()),
            PriceList {
                price: 1,
                metering: Metering::PerMinute,
            },
            PayoutPolicy::default(),
        );
        register.collect_payment(mint.issue(50)).await.unwrap();
        assert_eq!(
            register.payout_owner(true).await.unwrap(),
            PayoutOutcome::Skipped { balance: 50 }
        );
    }

    #[test]
    fn metering_parses_from_config_strings() {
        assert_eq!("kib".parse::<Metering>(), Ok(Metering::PerKib));
        assert_eq!("MIN".parse::<Metering>(), Ok(Metering::PerMinute));
        assert!("hour".parse::<Metering>().is_err());
    }
}
