//! NIP-04 encrypted direct messages.

use async_trait::async_trait;
use nostr::nips::nip04;
use nostr::{Event, Keys, Kind, PublicKey};
use thiserror::Error;

use crate::event::{sign_event, tag, EventError};
use crate::relay::{RelayError, RelayPool};

#[derive(Debug, Error)]
pub enum DmError {
    #[error("failed to encrypt direct message: {0}")]
    Encrypt(String),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("failed to publish direct message: {0}")]
    Publish(#[from] RelayError),
}

/// Delivers a private message to a pubkey.
#[async_trait]
pub trait DmPublisher: Send + Sync {
    async fn publish_dm(&self, recipient: &PublicKey, content: &str) -> Result<(), DmError>;
}

/// Signs kind-4 events with the operator key and publishes them to a relay
/// pool.
pub struct RelayDmPublisher {
    keys: Keys,
    pool: RelayPool,
}

impl RelayDmPublisher {
    pub fn new(keys: Keys, pool: RelayPool) -> Self {
        Self { keys, pool }
    }
}

/// Kind-4 event from `sender` carrying `plaintext` encrypted to `recipient`.
pub fn encrypted_dm(
    sender: &Keys,
    recipient: &PublicKey,
    plaintext: &str,
    created_at: u64,
) -> Result<Event, DmError> {
    let content = nip04::encrypt(sender.secret_key(), recipient, plaintext)
        .map_err(|err| DmError::Encrypt(err.to_string()))?;
    Ok(sign_event(
        sender,
        Kind::EncryptedDirectMessage,
        vec![tag("p", recipient.to_hex())],
        content,
        created_at,
    )?)
}

#[async_trait]
impl DmPublisher for RelayDmPublisher {
    async fn publish_dm(&self, recipient: &PublicKey, content: &str) -> Result<(), DmError> {
        let event = encrypted_dm(&self.keys, recipient, content, crate::unix_now())?;
        let accepted = self.pool.publish(&event).await?;
        tracing::info!(recipient = %recipient, event_id = %event.id, accepted, "direct message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TagLookup;

    #[test]
    fn recipient_can_decrypt() {
        let operator = Keys::generate();
        let proxy = Keys::generate();

        let event = encrypted_dm(&proxy, &operator.public_key(), "cashuBo2F0", 1_700_000_000).unwrap();
        event.verify().unwrap();
        assert_eq!(event.kind, Kind::EncryptedDirectMessage);
        assert_eq!(event.tag_value("p"), Some(operator.public_key().to_hex().as_str()));
        assert!(event.content.contains("?iv="));

        let plain = nip04::decrypt(operator.secret_key(), &proxy.public_key(), &event.content).unwrap();
        assert_eq!(plain, "cashuBo2F0");
    }

    #[test]
    fn third_party_cannot_decrypt() {
        let operator = Keys::generate();
        let proxy = Keys::generate();
        let eve = Keys::generate();

        let event = encrypted_dm(&proxy, &operator.public_key(), "secret profits", 1).unwrap();
        // Decryption with the wrong shared key either fails padding checks
        // or yields noise.
        if let Ok(plain) = nip04::decrypt(eve.secret_key(), &proxy.public_key(), &event.content) {
            assert_ne!(plain, "secret profits");
        }
    }
}
