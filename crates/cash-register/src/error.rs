use thiserror::Error;

/// Failures talking to the mint.
#[derive(Debug, Error)]
pub enum MintError {
    /// Transport failures and mint error responses, as reported by the CDK
    /// HTTP client.
    #[error("mint request failed: {0}")]
    Client(#[from] cdk::Error),

    /// The mint refused the request (already spent, unknown keyset, bad
    /// signature, unbalanced swap, ...).
    #[error("mint rejected request: {detail}")]
    Rejected { code: Option<u64>, detail: String },

    #[error("mint unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no proofs supplied")]
    Empty,

    #[error("duplicate proof in batch")]
    DuplicateProof,

    #[error("proof keyset '{0}' is not issued by this mint")]
    UnknownKeyset(String),

    #[error("mint has no active keyset for unit '{0}'")]
    NoActiveKeyset(String),

    #[error("amount {amount} does not cover the swap fee of {fee}")]
    InsufficientAmount { amount: u64, fee: u64 },

    #[error("mint returned {got} signatures for {expected} outputs")]
    SignatureCount { expected: usize, got: usize },

    #[error("invalid key for P2PK: {0}")]
    Key(String),

    #[error(transparent)]
    Mint(#[from] MintError),

    #[error("ecash crypto failed: {0}")]
    Crypto(String),
}

/// What a paying client is told. Deliberately coarse: mint error details
/// would tell a client which proofs are valid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment failed")]
    Failed,

    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("failed to withdraw wallet balance: {0}")]
    Withdraw(#[from] WalletError),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("undecodable token: {0}")]
    Decode(String),

    #[error("token contains no proofs")]
    Empty,

    #[error("token contains proofs from mint '{0}'")]
    WrongMint(String),

    #[error("token unit '{0}' is not accepted")]
    WrongUnit(String),
}
