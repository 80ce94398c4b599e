use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cdk::amount::SplitTarget;
use cdk::dhke::construct_proofs;
use cdk::mint_url::MintUrl;
use cdk::nuts::{CurrencyUnit, KeySetInfo, PreMintSecrets, SpendingConditions, SwapRequest};
use cdk::Amount;
use nostr_link::{Keys, PublicKey};
use tokio::sync::Mutex;

use crate::error::WalletError;
use crate::mint::Mint;
use crate::proof::{lock_key, locked_to, same_x_only, signing_key, total_amount, Proof, Proofs};

/// Result of redeeming a batch of proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redemption {
    /// Value added to the wallet, after mint fees.
    pub received: u64,
    /// Wallet balance after the batch was added.
    pub balance: u64,
}

/// Holds the proxy's redeemed proofs.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Swap `proofs` at the mint and keep the fresh ones. A batch with any
    /// invalid proof adds nothing.
    async fn add(&self, proofs: Proofs) -> Result<Redemption, WalletError>;

    /// Atomically empty the wallet, swapping everything into fresh proofs,
    /// optionally P2PK-locked to `lock_to`. On failure the held set is
    /// untouched.
    async fn take_all(&self, lock_to: Option<&PublicKey>) -> Result<Proofs, WalletError>;

    /// Empty the wallet into fresh bearer proofs.
    async fn withdraw_all(&self) -> Result<Proofs, WalletError> {
        self.take_all(None).await
    }

    /// Put previously withdrawn proofs back without redeeming them again.
    /// Returns the new balance.
    async fn restore(&self, proofs: Proofs) -> u64;

    async fn balance(&self) -> u64;

    fn mint_url(&self) -> &MintUrl;

    fn unit(&self) -> &CurrencyUnit;
}

/// A [`Wallet`] backed by one mint.
pub struct ProofWallet {
    mint: Arc<dyn Mint>,
    keys: Keys,
    unit: CurrencyUnit,
    held: Mutex<Proofs>,
}

impl ProofWallet {
    /// `keys` sign incoming proofs that are P2PK-locked to the proxy.
    pub fn new(mint: Arc<dyn Mint>, keys: Keys, unit: CurrencyUnit) -> Self {
        Self {
            mint,
            keys,
            unit,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Witness every input locked to the proxy key. Proofs locked to
    /// anyone else are left for the mint to refuse.
    fn unlock_inputs(&self, inputs: &mut [Proof]) -> Result<(), WalletError> {
        let signer = signing_key(&self.keys)?;
        let me = signer.public_key();
        for proof in inputs {
            if locked_to(proof).is_some_and(|lock| same_x_only(&lock, &me)) {
                proof
                    .sign_p2pk(signer.clone())
                    .map_err(|err| WalletError::Crypto(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Swap `inputs` into fresh proofs at the active keyset. Nothing is held
    /// or released here; callers decide what to do with the result.
    async fn swap_into_fresh(&self, mut inputs: Proofs, lock_to: Option<&PublicKey>) -> Result<Proofs, WalletError> {
        let keysets = self.mint.keysets().await?;
        let fee = input_fee(&inputs, &keysets)?;
        let amount = total_amount(&inputs);
        if amount <= fee {
            return Err(WalletError::InsufficientAmount { amount, fee });
        }

        let active = keysets
            .iter()
            .find(|k| k.active && k.unit == self.unit)
            .ok_or_else(|| WalletError::NoActiveKeyset(self.unit.to_string()))?;
        let keyset = self.mint.keys(active.id).await?;

        self.unlock_inputs(&mut inputs)?;

        let target = SplitTarget::default();
        let outputs = match lock_to {
            Some(owner) => {
                let conditions = SpendingConditions::new_p2pk(lock_key(owner)?, None);
                PreMintSecrets::with_conditions(keyset.id, Amount::from(amount - fee), &target, &conditions)
            }
            None => PreMintSecrets::random(keyset.id, Amount::from(amount - fee), &target),
        }
        .map_err(|err| WalletError::Crypto(err.to_string()))?;

        let expected = outputs.blinded_messages().len();
        let response = self
            .mint
            .swap(SwapRequest::new(inputs, outputs.blinded_messages()))
            .await?;
        if response.signatures.len() != expected {
            return Err(WalletError::SignatureCount {
                expected,
                got: response.signatures.len(),
            });
        }

        construct_proofs(response.signatures, outputs.rs(), outputs.secrets(), &keyset.keys)
            .map_err(|err| WalletError::Crypto(err.to_string()))
    }
}

/// Total fee for spending `inputs` (NUT-02), rounded up to whole units.
fn input_fee(inputs: &[Proof], keysets: &[KeySetInfo]) -> Result<u64, WalletError> {
    let mut ppk = 0u64;
    for proof in inputs {
        let keyset = keysets
            .iter()
            .find(|k| k.id == proof.keyset_id)
            .ok_or_else(|| WalletError::UnknownKeyset(proof.keyset_id.to_string()))?;
        ppk = ppk.saturating_add(keyset.input_fee_ppk);
    }
    Ok(ppk.div_ceil(1000))
}

#[async_trait]
impl Wallet for ProofWallet {
    async fn add(&self, proofs: Proofs) -> Result<Redemption, WalletError> {
        if proofs.is_empty() {
            return Err(WalletError::Empty);
        }
        let mut secrets = HashSet::new();
        if !proofs.iter().all(|p| secrets.insert(p.secret.to_string())) {
            return Err(WalletError::DuplicateProof);
        }

        let offered = total_amount(&proofs);
        let fresh = self.swap_into_fresh(proofs, None).await?;
        let received = total_amount(&fresh);

        let mut held = self.held.lock().await;
        held.extend(fresh);
        let balance = total_amount(&held);

        tracing::info!(offered, received, balance, "proofs redeemed");
        Ok(Redemption { received, balance })
    }

    async fn take_all(&self, lock_to: Option<&PublicKey>) -> Result<Proofs, WalletError> {
        let taken = std::mem::take(&mut *self.held.lock().await);
        if taken.is_empty() {
            return Ok(taken);
        }

        match self.swap_into_fresh(taken.clone(), lock_to).await {
            Ok(fresh) => {
                tracing::info!(
                    amount = total_amount(&fresh),
                    locked = lock_to.is_some(),
                    "wallet emptied"
                );
                Ok(fresh)
            }
            Err(err) => {
                self.held.lock().await.extend(taken);
                Err(err)
            }
        }
    }

    async fn restore(&self, proofs: Proofs) -> u64 {
        let mut held = self.held.lock().await;
        held.extend(proofs);
        total_amount(&held)
    }

    async fn balance(&self) -> u64 {
        total_amount(&self.held.lock().await)
    }

    fn mint_url(&self) -> &MintUrl {
        self.mint.url()
    }

    fn unit(&self) -> &CurrencyUnit {
        &self.unit
    }
}
