//! Key parsing.
//!
//! Secret keys are accepted as 64-char hex or NIP-19 `nsec` (via
//! [`nostr::Keys::parse`]); public keys as 64-char hex (x-only) or `npub`.

use nostr::{PublicKey, ToBech32};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid public key '{value}': {reason}")]
pub struct KeyError {
    pub value: String,
    pub reason: String,
}

/// Parse a public key from `npub1...` or 64-char hex.
pub fn parse_public_key(value: &str) -> Result<PublicKey, KeyError> {
    let value = value.trim();
    PublicKey::parse(value).map_err(|err| KeyError {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// True if `value` looks like a hex-encoded x-only pubkey.
pub fn is_pubkey_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// NIP-19 encoding for logs; empty if encoding fails.
pub fn npub(pubkey: &PublicKey) -> String {
    pubkey.to_bech32().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    const SECRET_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000003";
    const PUBKEY_HEX: &str = "f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9";

    #[test]
    fn parses_hex_secret() {
        let keys = Keys::parse(SECRET_HEX).unwrap();
        assert_eq!(keys.public_key().to_hex(), PUBKEY_HEX);
    }

    #[test]
    fn npub_round_trips_through_parse() {
        let keys = Keys::generate();
        let encoded = npub(&keys.public_key());
        assert!(encoded.starts_with("npub1"));
        assert_eq!(parse_public_key(&encoded).unwrap(), keys.public_key());
        assert_eq!(parse_public_key(&keys.public_key().to_hex()).unwrap(), keys.public_key());
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_public_key("npub1nope").unwrap_err();
        assert_eq!(err.value, "npub1nope");
        assert!(parse_public_key("zz").is_err());
    }

    #[test]
    fn pubkey_hex_detection() {
        assert!(is_pubkey_hex(PUBKEY_HEX));
        assert!(!is_pubkey_hex("wss://relay.example.com"));
        assert!(!is_pubkey_hex(&PUBKEY_HEX[..63]));
    }
}
