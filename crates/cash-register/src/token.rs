//! Serialized Cashu tokens, as pasted by clients and sent to the operator.
//!
//! Decoding accepts both `cashuA` (V3) and `cashuB` (V4); payouts are
//! always encoded as V4.

use std::str::FromStr;

use cdk::mint_url::MintUrl;
use cdk::nuts::{CurrencyUnit, Proofs, Token};

use crate::error::TokenError;

/// Decode `token` and return its proofs if they were issued by `mint` in
/// `unit`.
pub fn proofs_for_mint(token: &str, mint: &MintUrl, unit: &CurrencyUnit) -> Result<Proofs, TokenError> {
    let token = Token::from_str(token.trim()).map_err(|err| TokenError::Decode(err.to_string()))?;

    let issuer = token.mint_url().map_err(|err| TokenError::Decode(err.to_string()))?;
    if issuer != *mint {
        return Err(TokenError::WrongMint(issuer.to_string()));
    }
    if let Some(token_unit) = token.unit() {
        if token_unit != *unit {
            return Err(TokenError::WrongUnit(token_unit.to_string()));
        }
    }

    let proofs = token.proofs();
    if proofs.is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(proofs)
}

/// V4 token carrying `proofs`.
pub fn encode(mint: &MintUrl, proofs: Proofs, unit: &CurrencyUnit) -> String {
    Token::new(mint.clone(), proofs, None, unit.clone()).to_string()
}
