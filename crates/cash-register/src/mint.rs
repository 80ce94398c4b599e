use async_trait::async_trait;
use cdk::mint_url::MintUrl;
use cdk::nuts::{Id, KeySet, KeySetInfo, SwapRequest, SwapResponse};
use cdk::wallet::{HttpClient, MintConnector};

use crate::error::MintError;

/// The slice of the mint API the wallet needs.
#[async_trait]
pub trait Mint: Send + Sync {
    fn url(&self) -> &MintUrl;

    async fn keysets(&self) -> Result<Vec<KeySetInfo>, MintError>;

    async fn keys(&self, keyset_id: Id) -> Result<KeySet, MintError>;

    /// Spend the request's inputs and have its outputs signed, atomically:
    /// either every input is spent and every output signed, or nothing
    /// happens.
    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError>;
}

/// Cashu mint reached over HTTP(S) through the CDK client.
pub struct HttpMint {
    url: MintUrl,
    client: HttpClient,
}

impl HttpMint {
    pub fn new(url: MintUrl) -> Self {
        Self {
            client: HttpClient::new(url.clone()),
            url,
        }
    }
}

#[async_trait]
impl Mint for HttpMint {
    fn url(&self) -> &MintUrl {
        &self.url
    }

    async fn keysets(&self) -> Result<Vec<KeySetInfo>, MintError> {
        Ok(self.client.get_mint_keysets().await?.keysets)
    }

    async fn keys(&self, keyset_id: Id) -> Result<KeySet, MintError> {
        Ok(self.client.get_mint_keyset(keyset_id).await?)
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError> {
        Ok(self.client.post_swap(request).await?)
    }
}
