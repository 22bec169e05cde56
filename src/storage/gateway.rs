//! HTTP bridge to the storage gateway
//!
//! The storage SDK runs behind a small gateway service that holds the wallet
//! connection. Every session operation maps to one JSON call under
//! `{gateway}/v1/`. Token amounts travel as decimal strings of base units because
//! they do not fit in a JSON number.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;

use super::{
    truncate_address, Network, ProofSet, ServiceAllowance, ServiceEvent, ServiceEventListener,
    SessionOptions, StorageConnector, StoragePricing, StorageService, StorageSession,
    TokenAmount, TransactionInfo, UploadCallbacks, UploadReceipt, WalletSigner,
};
use crate::error::{Error, Result};
use crate::tip::TokenTransfer;

fn amount(value: &str) -> Result<TokenAmount> {
    value
        .parse::<u128>()
        .map(TokenAmount)
        .map_err(|_| Error::UploadTransportError(format!("gateway sent invalid amount '{value}'")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderResponse {
    provider_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageResponse {
    service_id: String,
    provider_id: u64,
    #[serde(default)]
    proof_set_id: Option<u64>,
    #[serde(default)]
    events: Vec<ServiceEvent>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    wallet: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllowanceResponse {
    rate_allowance: String,
    lockup_allowance: String,
    rate_used: String,
    lockup_used: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingResponse {
    price_per_tib_per_month_no_cdn: String,
    price_per_tib_per_month_with_cdn: String,
    epochs_per_month: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    commp: String,
    size: u64,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    root_ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    data: String,
    sha256: &'a str,
}

/// Shared HTTP plumbing for every gateway object
#[derive(Clone)]
struct GatewayClient {
    client: Client,
    base: Url,
}

impl GatewayClient {
    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::ConfigError(format!("invalid gateway path {path}: {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UploadTransportError(format!(
                "gateway returned {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        self.send(self.client.get(url)).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let url = self.url(path)?;
        self.send(self.client.post(url).json(body)).await
    }
}

/// Opens sessions on a storage gateway
pub struct GatewayConnector {
    inner: GatewayClient,
}

impl GatewayConnector {
    pub fn new(base: Url) -> Self {
        Self::with_client(Client::new(), base)
    }

    pub fn with_client(client: Client, mut base: Url) -> Self {
        // `Url::join` drops the last segment unless the base ends with a slash
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Self {
            inner: GatewayClient { client, base },
        }
    }

    /// Open a session and keep the concrete type, e.g. to send tips through it
    #[instrument(skip(self, signer), fields(wallet = %truncate_address(signer.address())))]
    pub async fn open(
        &self,
        signer: &dyn WalletSigner,
        options: SessionOptions,
    ) -> Result<GatewaySession> {
        let body = json!({
            "address": signer.address(),
            "chainId": signer.chain_id(),
            "network": options.network,
            "withCdn": options.with_cdn,
        });
        let response: SessionResponse = self.inner.post("v1/sessions", &body).await?;
        debug!("Gateway session {} opened", response.session_id);
        Ok(GatewaySession {
            inner: self.inner.clone(),
            id: response.session_id,
            address: signer.address().to_string(),
            network: options.network,
        })
    }
}

#[async_trait]
impl StorageConnector for GatewayConnector {
    async fn connect(
        &self,
        signer: Arc<dyn WalletSigner>,
        options: SessionOptions,
    ) -> Result<Arc<dyn StorageSession>> {
        let session = self.open(signer.as_ref(), options).await?;
        Ok(Arc::new(session))
    }
}

pub struct GatewaySession {
    inner: GatewayClient,
    id: String,
    address: String,
    network: Network,
}

impl GatewaySession {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn path(&self, rest: &str) -> String {
        format!("v1/sessions/{}/{}", self.id, rest)
    }
}

#[async_trait]
impl StorageSession for GatewaySession {
    fn network(&self) -> Network {
        self.network
    }

    fn signer_address(&self) -> &str {
        &self.address
    }

    async fn client_proof_sets(&self, address: &str) -> Result<Vec<ProofSet>> {
        let mut url = self.inner.url(&self.path("proof-sets"))?;
        url.query_pairs_mut().append_pair("address", address);
        self.inner.send(self.inner.client.get(url)).await
    }

    async fn provider_id_by_address(&self, payee: &str) -> Result<u64> {
        let response: ProviderResponse = self.inner.get(&self.path(&format!("providers/{payee}"))).await?;
        Ok(response.provider_id)
    }

    async fn create_storage(
        &self,
        provider_id: Option<u64>,
        listener: Arc<dyn ServiceEventListener>,
    ) -> Result<Arc<dyn StorageService>> {
        let body = json!({ "providerId": provider_id });
        let response: StorageResponse = self.inner.post(&self.path("storage"), &body).await?;
        for event in &response.events {
            listener.on_event(event);
        }
        Ok(Arc::new(GatewayService {
            inner: self.inner.clone(),
            id: response.service_id,
            provider_id: response.provider_id,
            proof_set_id: response.proof_set_id,
        }))
    }

    async fn wallet_balance(&self) -> Result<TokenAmount> {
        let response: BalanceResponse = self.inner.get(&self.path("balance")).await?;
        amount(&response.wallet)
    }

    async fn available_funds(&self) -> Result<TokenAmount> {
        let response: BalanceResponse = self.inner.get(&self.path("balance")).await?;
        amount(&response.available)
    }

    async fn service_allowance(&self) -> Result<ServiceAllowance> {
        let response: AllowanceResponse = self.inner.get(&self.path("allowance")).await?;
        Ok(ServiceAllowance {
            rate_allowance: amount(&response.rate_allowance)?,
            lockup_allowance: amount(&response.lockup_allowance)?,
            rate_used: amount(&response.rate_used)?,
            lockup_used: amount(&response.lockup_used)?,
        })
    }

    async fn storage_pricing(&self) -> Result<StoragePricing> {
        let response: PricingResponse = self.inner.get(&self.path("pricing")).await?;
        Ok(StoragePricing {
            price_per_tib_per_month_no_cdn: amount(&response.price_per_tib_per_month_no_cdn)?,
            price_per_tib_per_month_with_cdn: amount(&response.price_per_tib_per_month_with_cdn)?,
            epochs_per_month: response.epochs_per_month,
        })
    }

    async fn deposit(&self, value: TokenAmount) -> Result<TransactionInfo> {
        let body = json!({ "amount": value.base_units().to_string() });
        self.inner.post(&self.path("deposit"), &body).await
    }

    async fn approve_service(
        &self,
        rate_allowance: TokenAmount,
        lockup_allowance: TokenAmount,
    ) -> Result<TransactionInfo> {
        let body = json!({
            "rateAllowance": rate_allowance.base_units().to_string(),
            "lockupAllowance": lockup_allowance.base_units().to_string(),
        });
        self.inner.post(&self.path("approve"), &body).await
    }
}

#[async_trait]
impl TokenTransfer for GatewaySession {
    async fn transfer(&self, recipient: &str, value: TokenAmount) -> Result<TransactionInfo> {
        let body = json!({
            "recipient": recipient,
            "amount": value.base_units().to_string(),
        });
        self.inner.post(&self.path("transfer"), &body).await
    }
}

struct GatewayService {
    inner: GatewayClient,
    id: String,
    provider_id: u64,
    proof_set_id: Option<u64>,
}

#[async_trait]
impl StorageService for GatewayService {
    fn provider_id(&self) -> u64 {
        self.provider_id
    }

    fn proof_set_id(&self) -> Option<u64> {
        self.proof_set_id
    }

    /// The gateway answers once the roots are confirmed; the sub-events are replayed
    /// from its response in order.
    async fn upload(&self, data: Vec<u8>, callbacks: &dyn UploadCallbacks) -> Result<UploadReceipt> {
        let digest = hex::encode(Sha256::digest(&data));
        let request = UploadRequest {
            data: base64::engine::general_purpose::STANDARD.encode(&data),
            sha256: &digest,
        };
        let url = self.inner.url(&format!("v1/services/{}/upload", self.id))?;
        // Connection and decode failures during the transfer belong to the upload
        let response: UploadResponse = self
            .inner
            .send(self.inner.client.post(url).json(&request))
            .await
            .map_err(|e| match e {
                Error::HttpError(e) => Error::UploadTransportError(e.to_string()),
                other => other,
            })?;
        if response.size != data.len() as u64 {
            return Err(Error::UploadTransportError(format!(
                "gateway stored {} bytes, sent {}",
                response.size,
                data.len()
            )));
        }

        callbacks.on_upload_complete(&response.commp);
        let tx = response.tx_hash.map(|hash| TransactionInfo { hash });
        callbacks.on_root_added(tx.as_ref());
        callbacks.on_root_confirmed(&response.root_ids);

        Ok(UploadReceipt {
            commp: response.commp,
            size: response.size,
            root_id: response.root_ids.first().copied(),
        })
    }
}
