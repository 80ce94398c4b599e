use cash_register::{PaymentRequest, Proofs};
use nostr_link::{is_pubkey_hex, Event, EventError};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Problems with a control frame. Reported to the client; the connection
/// stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame")]
    Malformed,

    #[error("missing target")]
    MissingTarget,

    #[error("invalid target '{0}' (expected a ws:// or wss:// url or a hex pubkey)")]
    InvalidTarget(String),

    #[error("invalid payment")]
    InvalidPayment,

    #[error("invalid AUTH event: {0}")]
    InvalidEvent(#[from] EventError),
}

/// Where a client wants to be connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Url(String),
    Pubkey(String),
}

impl Target {
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let value = value.trim();
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Ok(Target::Url(value.to_string()))
        } else if is_pubkey_hex(&lower) {
            Ok(Target::Pubkey(lower))
        } else {
            Err(ProtocolError::InvalidTarget(value.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payment {
    Proofs(Proofs),
    /// A serialized `cashuA` or `cashuB` token.
    Token(String),
}

impl Payment {
    /// Accepts a proof array, a token string, or either of those embedded
    /// as a JSON string. `null` means no payment.
    fn from_value(value: &Value) -> Result<Option<Self>, ProtocolError> {
        match value {
            Value::Null => Ok(None),
            Value::Array(_) => serde_json::from_value::<Proofs>(value.clone())
                .map(|proofs| Some(Payment::Proofs(proofs)))
                .map_err(|_| ProtocolError::InvalidPayment),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) if s.trim_start().starts_with("cashu") => {
                Ok(Some(Payment::Token(s.trim().to_string())))
            }
            Value::String(s) => {
                let inner: Value = serde_json::from_str(s).map_err(|_| ProtocolError::InvalidPayment)?;
                match inner {
                    Value::String(_) | Value::Array(_) => Self::from_value(&inner),
                    _ => Err(ProtocolError::InvalidPayment),
                }
            }
            _ => Err(ProtocolError::InvalidPayment),
        }
    }
}

/// A frame from the client, as far as the proxy cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// `["PROXY", target, payment?]`
    Proxy {
        target: Target,
        payment: Option<Payment>,
    },
    /// `["AUTH", event]` whose content is an ecash token.
    Auth(Event),
    /// Anything else; forwarded to the upstream.
    Other,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: Vec<Value> = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) if leading_command(text) == Some("PROXY") => return Err(ProtocolError::Malformed),
            Err(_) => return Ok(ClientFrame::Other),
        };

        match frame.first().and_then(Value::as_str) {
            Some("PROXY") => {}
            Some("AUTH") => {
                // Relay AUTH (NIP-42) passes through; only token-bearing
                // events are payments.
                let Some(event) = frame.get(1).filter(|e| {
                    e.get("content")
                        .and_then(Value::as_str)
                        .is_some_and(|c| c.trim_start().starts_with("cashu"))
                }) else {
                    return Ok(ClientFrame::Other);
                };
                // Signatures are checked by the switchboard, which answers
                // with an OK frame either way.
                let event: Event = serde_json::from_value(event.clone()).map_err(EventError::from)?;
                return Ok(ClientFrame::Auth(event));
            }
            _ => return Ok(ClientFrame::Other),
        }

        let target = match frame.get(1) {
            Some(Value::String(target)) => Target::parse(target)?,
            Some(Value::Null) | None => return Err(ProtocolError::MissingTarget),
            Some(_) => return Err(ProtocolError::Malformed),
        };
        let payment = match frame.get(2) {
            Some(value) => Payment::from_value(value)?,
            None => None,
        };
        Ok(ClientFrame::Proxy { target, payment })
    }
}

/// First element of what looks like a JSON array of strings, for frames too
/// broken to parse.
fn leading_command(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix('[')?.trim_start().strip_prefix('"')?;
    rest.split('"').next()
}

/// Frames the proxy sends to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connecting,
    Connected,
    PaymentRequired(PaymentRequest),
    Error(String),
    /// Reply to an `AUTH` payment.
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> Value {
        match self {
            ServerFrame::Connecting => serde_json::json!(["PROXY", "CONNECTING"]),
            ServerFrame::Connected => serde_json::json!(["PROXY", "CONNECTED"]),
            ServerFrame::PaymentRequired(request) => {
                serde_json::json!(["PROXY", "PAYMENT_REQUIRED", request])
            }
            ServerFrame::Error(message) => serde_json::json!(["PROXY", "ERROR", message]),
            ServerFrame::Ok {
                event_id,
                accepted,
                reason,
            } => serde_json::json!(["OK", event_id, accepted, reason]),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::Text(self.to_json().to_string().into())
    }
}
