//! Payment collection for the toll-proxy.
//!
//! Clients pay with Cashu ecash. Every payment is swapped at the configured
//! mint before it counts, so a proof that was already spent (or belongs to
//! another mint) never credits an allowance. Swapped proofs pool in a single
//! [`Wallet`]; the [`CashRegister`] periodically hands the pooled balance to
//! the operator as a token inside an encrypted direct message.
//!
//! ```text
//!  client proofs --> CashRegister::collect_payment --> Wallet::add --> Mint::swap
//!                                                          |
//!  operator DM  <-- CashRegister::payout_owner  <-- Wallet::take_all
//! ```
//!
//! Proofs, tokens, blind signatures and the mint HTTP client are the CDK's
//! (`cdk::nuts`, `cdk::dhke`, `cdk::wallet::HttpClient`); this crate decides
//! when to swap and who gets paid.

pub mod error;
pub mod mint;
pub mod proof;
pub mod register;
pub mod token;
pub mod wallet;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{MintError, PaymentError, PayoutError, TokenError, WalletError};
pub use mint::{HttpMint, Mint};
pub use proof::{total_amount, Proof, Proofs};
pub use register::{CashRegister, Metering, PaymentRequest, PayoutOutcome, PayoutPolicy, PriceList, Register};
pub use wallet::{ProofWallet, Redemption, Wallet};

pub use cdk::mint_url::MintUrl;
pub use cdk::nuts::CurrencyUnit;
