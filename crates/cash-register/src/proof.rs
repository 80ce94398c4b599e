//! Proof helpers on top of the CDK NUT-00 types.

use cdk::nuts::{PublicKey, SecretKey, SpendingConditions};
use nostr_link::Keys;

pub use cdk::nuts::{Proof, Proofs};

use crate::error::WalletError;

/// Sum of proof amounts, saturating.
pub fn total_amount(proofs: &[Proof]) -> u64 {
    proofs
        .iter()
        .fold(0u64, |acc, p| acc.saturating_add(u64::from(p.amount)))
}

/// Cashu form of a Nostr pubkey. Nostr keys are x-only; P2PK verification
/// is Schnorr over the x coordinate, so the even-parity point stands in.
pub fn lock_key(pubkey: &nostr_link::PublicKey) -> Result<PublicKey, WalletError> {
    PublicKey::from_hex(format!("02{}", pubkey.to_hex())).map_err(|err| WalletError::Key(err.to_string()))
}

/// Cashu form of a Nostr secret key, for signing P2PK witnesses.
pub fn signing_key(keys: &Keys) -> Result<SecretKey, WalletError> {
    SecretKey::from_hex(keys.secret_key().to_secret_hex()).map_err(|err| WalletError::Key(err.to_string()))
}

/// The key a proof is P2PK-locked to, if any.
pub fn locked_to(proof: &Proof) -> Option<PublicKey> {
    match SpendingConditions::try_from(&proof.secret) {
        Ok(SpendingConditions::P2PKConditions { data, .. }) => Some(data),
        _ => None,
    }
}

/// Same x coordinate, ignoring parity.
pub(crate) fn same_x_only(a: &PublicKey, b: &PublicKey) -> bool {
    a.to_hex().get(2..) == b.to_hex().get(2..)
}
