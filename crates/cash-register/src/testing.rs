//! In-process stand-ins for the mint and the DM relay.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use cdk::amount::SplitTarget;
use cdk::dhke::{construct_proofs, sign_message, verify_message};
use cdk::mint_url::MintUrl;
use cdk::nuts::{
    BlindSignature, BlindedMessage, CurrencyUnit, Id, KeySet, KeySetInfo, Keys, PreMintSecrets, SecretKey,
    SpendingConditions, SwapRequest, SwapResponse,
};
use cdk::secret::Secret;
use cdk::Amount;
use nostr_link::{DmError, DmPublisher, PublicKey, RelayError};

use crate::error::MintError;
use crate::mint::Mint;
use crate::proof::{lock_key, Proof, Proofs};
use crate::token;

/// A mint with real keys that enforces the same rules a Cashu mint does:
/// valid signatures, no double spends, satisfied P2PK locks and balanced
/// swaps.
pub struct FakeMint {
    url: MintUrl,
    id: Id,
    secrets: BTreeMap<u64, SecretKey>,
    keys: Keys,
    input_fee_ppk: u64,
    spent: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl FakeMint {
    pub fn new(url: &str) -> Self {
        let mut secrets = BTreeMap::new();
        let mut publics = serde_json::Map::new();
        for bit in 0..=20 {
            let k = SecretKey::generate();
            publics.insert((1u64 << bit).to_string(), k.public_key().to_hex().into());
            secrets.insert(1u64 << bit, k);
        }
        let keys: Keys = serde_json::from_value(publics.into()).unwrap();
        Self {
            url: MintUrl::from_str(url).unwrap(),
            id: Id::from(&keys),
            secrets,
            keys,
            input_fee_ppk: 0,
            spent: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn with_input_fee_ppk(mut self, ppk: u64) -> Self {
        self.input_fee_ppk = ppk;
        self
    }

    pub fn keyset_id(&self) -> Id {
        self.id
    }

    /// While offline every request fails as if the mint were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_spent(&self, secret: &Secret) -> bool {
        self.spent.lock().unwrap().contains(&secret.to_string())
    }

    /// Unspent proofs worth `amount`.
    pub fn issue(&self, amount: u64) -> Proofs {
        let premint = PreMintSecrets::random(self.id, Amount::from(amount), &SplitTarget::default()).unwrap();
        self.sign_premint(premint)
    }

    /// Unspent proofs worth `amount` that only `owner` can spend.
    pub fn issue_locked(&self, amount: u64, owner: &PublicKey) -> Proofs {
        let conditions = SpendingConditions::new_p2pk(lock_key(owner).unwrap(), None);
        let premint =
            PreMintSecrets::with_conditions(self.id, Amount::from(amount), &SplitTarget::default(), &conditions)
                .unwrap();
        self.sign_premint(premint)
    }

    /// A V4 token for this mint worth `amount`.
    pub fn issue_token(&self, amount: u64) -> String {
        token::encode(&self.url, self.issue(amount), &CurrencyUnit::Sat)
    }

    fn sign_premint(&self, premint: PreMintSecrets) -> Proofs {
        let signatures = premint
            .blinded_messages()
            .iter()
            .map(|message| self.blind_sign(message).unwrap())
            .collect();
        construct_proofs(signatures, premint.rs(), premint.secrets(), &self.keys).unwrap()
    }

    fn blind_sign(&self, message: &BlindedMessage) -> Result<BlindSignature, MintError> {
        let k = self
            .secrets
            .get(&u64::from(message.amount))
            .ok_or_else(|| rejected(11005, "unsupported amount"))?;
        let c = sign_message(k, &message.blinded_secret).map_err(|_| rejected(10002, "invalid blinded message"))?;
        Ok(BlindSignature {
            amount: message.amount,
            keyset_id: self.id,
            c,
            dleq: None,
        })
    }

    fn ensure_online(&self) -> Result<(), MintError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(MintError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn check_input(&self, proof: &Proof) -> Result<(), MintError> {
        if proof.keyset_id != self.id {
            return Err(rejected(12001, "unknown keyset"));
        }
        let k = self
            .secrets
            .get(&u64::from(proof.amount))
            .ok_or_else(|| rejected(11005, "unsupported amount"))?;
        verify_message(k, proof.c, proof.secret.as_bytes()).map_err(|_| rejected(10003, "invalid proof"))?;
        if SpendingConditions::try_from(&proof.secret).is_ok() {
            proof
                .verify_p2pk()
                .map_err(|_| rejected(20008, "witness does not satisfy lock"))?;
        }
        Ok(())
    }
}

fn rejected(code: u64, detail: &str) -> MintError {
    MintError::Rejected {
        code: Some(code),
        detail: detail.to_string(),
    }
}

#[async_trait]
impl Mint for FakeMint {
    fn url(&self) -> &MintUrl {
        &self.url
    }

    async fn keysets(&self) -> Result<Vec<KeySetInfo>, MintError> {
        self.ensure_online()?;
        let info = serde_json::json!({
            "id": self.id.to_string(),
            "unit": "sat",
            "active": true,
            "input_fee_ppk": self.input_fee_ppk,
        });
        Ok(vec![serde_json::from_value(info).unwrap()])
    }

    async fn keys(&self, keyset_id: Id) -> Result<KeySet, MintError> {
        self.ensure_online()?;
        if keyset_id != self.id {
            return Err(rejected(12001, "unknown keyset"));
        }
        let keyset = serde_json::json!({
            "id": self.id.to_string(),
            "unit": "sat",
            "keys": self.keys,
        });
        Ok(serde_json::from_value(keyset).unwrap())
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError> {
        self.ensure_online()?;
        let inputs = request.inputs();
        let outputs = request.outputs();

        let mut spent = self.spent.lock().unwrap();
        let mut seen = HashSet::new();
        for proof in inputs {
            self.check_input(proof)?;
            let secret = proof.secret.to_string();
            if spent.contains(&secret) || !seen.insert(secret) {
                return Err(rejected(11001, "proof already spent"));
            }
        }

        let fee = (inputs.len() as u64 * self.input_fee_ppk).div_ceil(1000);
        let input_total: u64 = inputs.iter().map(|p| u64::from(p.amount)).sum();
        let output_total: u64 = outputs.iter().map(|o| u64::from(o.amount)).sum();
        if input_total != output_total + fee {
            return Err(rejected(11002, "transaction is not balanced"));
        }

        let signatures = outputs
            .iter()
            .map(|output| self.blind_sign(output))
            .collect::<Result<Vec<_>, _>>()?;

        spent.extend(seen);
        Ok(SwapResponse { signatures })
    }
}

/// Records DMs instead of sending them.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(PublicKey, String)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While failing every publish is refused by all relays.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(PublicKey, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DmPublisher for RecordingPublisher {
    async fn publish_dm(&self, recipient: &PublicKey, content: &str) -> Result<(), DmError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DmError::Publish(RelayError::AllFailed));
        }
        self.sent.lock().unwrap().push((*recipient, content.to_string()));
        Ok(())
    }
}
