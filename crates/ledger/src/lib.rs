//! Append-only JSON-lines ledger for the toll-proxy.
//!
//! Every business event the proxy cares about after the fact (a connection
//! opening, a payment being redeemed or refused, an allowance running out, an
//! operator payout leaving the wallet) is serialised as a single
//! newline-terminated JSON object and appended to a ledger file. The ledger
//! is the operator's record of what was earned and where it went; `tracing`
//! output remains the place for diagnostics.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use ledger::{LedgerEntry, LedgerEvent, LedgerSink};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, handle) = LedgerSink::start("/var/lib/toll-proxy/ledger.jsonl").await?;
//!
//! sink.log(
//!     LedgerEntry::new(LedgerEvent::PaymentCollected, serde_json::json!({"unit": "sat"}))
//!         .with_amount(21),
//! )
//! .await;
//!
//! // Drain and sync before exit, even if other sink clones remain.
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{ConnectionRef, LedgerEntry, LedgerEvent};
pub use sink::{LedgerHandle, LedgerSink};
pub use writer::{LedgerWriteError, LedgerWriter};
