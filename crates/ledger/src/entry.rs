use serde::{Deserialize, Serialize};

/// A single ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: LedgerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionRef>,
    /// Amount in the mint's unit, for events that move value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    pub details: serde_json::Value,
}

impl LedgerEntry {
    /// Create an entry stamped with a fresh UUID v4 and the current UTC time.
    pub fn new(event: LedgerEvent, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event,
            connection: None,
            amount: None,
            details,
        }
    }

    /// Attach the connection this event belongs to.
    pub fn with_connection(mut self, connection: ConnectionRef) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    ConnectionOpened,
    ConnectionClosed,
    PaymentCollected,
    PaymentRejected,
    AllowanceExhausted,
    TargetUnresolved,
    UpstreamFailed,
    PayoutSent,
    PayoutReturned,
    /// Payout proofs locked to the operator key could not be delivered. The
    /// encoded token is kept in `details` so it can be handed over manually.
    PayoutStranded,
    ProcessStarted,
    ProcessStopped,
}

/// Identifies the client connection an entry relates to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub connection_id: uuid::Uuid,
    pub remote_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ConnectionRef {
    pub fn new(connection_id: uuid::Uuid, remote_addr: impl Into<String>) -> Self {
        Self {
            connection_id,
            remote_addr: remote_addr.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}
