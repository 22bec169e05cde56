//! Storage network collaborators
//!
//! The storage network (sessions, proof sets, payments and uploads) is an external
//! SDK. This module defines the traits the rest of the crate talks to, the small value
//! types that cross them, and the managers that memoize sessions and services.

pub mod context;
pub mod gateway;
pub mod memory;
pub mod preflight;
pub mod proof_set;
pub mod service;
pub mod session;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

pub use context::StorageContext;
pub use preflight::{PreflightChecker, PreflightConfig};
pub use proof_set::{select_best_proof_set, ProofSet, ProofSetResolver, ResolvedProofSet};
pub use service::{ServiceEvent, StorageServiceBuilder};
pub use session::SessionManager;

/// Filecoin network the wallet is connected to
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    #[default]
    Calibration,
}

impl Network {
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Mainnet => 314,
            Network::Calibration => 314159,
        }
    }

    pub fn from_chain_id(chain_id: u64) -> Option<Self> {
        match chain_id {
            314 => Some(Network::Mainnet),
            314159 => Some(Network::Calibration),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Calibration => "calibration",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "calibration" => Ok(Network::Calibration),
            other => Err(Error::ConfigError(format!(
                "unknown network '{other}', expected mainnet or calibration"
            ))),
        }
    }
}

/// USDFC amount in base units (18 decimals)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub const DECIMALS: u32 = 18;
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub fn base_units(&self) -> u128 {
        self.0
    }

    pub fn saturating_sub(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_add(other.0))
    }

    /// Parse a decimal string such as `"12.5"` into base units.
    ///
    /// More than 18 fractional digits, signs, exponents and empty input are rejected.
    pub fn parse_units(value: &str) -> Result<TokenAmount> {
        let value = value.trim();
        let invalid = || Error::ValidationError(format!("invalid token amount '{value}'"));

        let (whole, frac) = match value.split_once('.') {
            Some((w, f)) => (w, f),
            None => (value, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }
        if frac.len() > Self::DECIMALS as usize {
            return Err(invalid());
        }

        let scale = 10u128.pow(Self::DECIMALS);
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_units: u128 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = Self::DECIMALS as usize);
            padded.parse().map_err(|_| invalid())?
        };

        whole
            .checked_mul(scale)
            .and_then(|w| w.checked_add(frac_units))
            .map(TokenAmount)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 10u128.pow(Self::DECIMALS);
        let whole = self.0 / scale;
        let frac = self.0 % scale;
        if frac == 0 {
            return write!(f, "{whole} USDFC");
        }
        let frac = format!("{frac:0>width$}", width = Self::DECIMALS as usize);
        write!(f, "{whole}.{} USDFC", frac.trim_end_matches('0'))
    }
}

/// Wallet capability handed over by the wallet-connection layer
pub trait WalletSigner: Send + Sync {
    /// Checksummed or lower-case 0x address of the connected account
    fn address(&self) -> &str;

    fn chain_id(&self) -> u64;
}

/// A signer known only by address; signing happens on the gateway side
#[derive(Debug, Clone)]
pub struct StaticSigner {
    address: String,
    chain_id: u64,
}

impl StaticSigner {
    pub fn new(address: impl Into<String>, chain_id: u64) -> Self {
        Self {
            address: address.into(),
            chain_id,
        }
    }
}

impl WalletSigner for StaticSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// Options used when opening a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub network: Network,
    pub with_cdn: bool,
}

/// Deposited funds and spending allowances held in the payments contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAllowance {
    pub rate_allowance: TokenAmount,
    pub lockup_allowance: TokenAmount,
    pub rate_used: TokenAmount,
    pub lockup_used: TokenAmount,
}

/// Storage price list as published by the storage service contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePricing {
    pub price_per_tib_per_month_no_cdn: TokenAmount,
    pub price_per_tib_per_month_with_cdn: TokenAmount,
    pub epochs_per_month: u64,
}

/// Transaction reported when roots are added to a proof set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub hash: String,
}

/// Result of a completed upload as returned by the storage service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub commp: String,
    pub size: u64,
    #[serde(default)]
    pub root_id: Option<u64>,
}

/// Upload sub-event callbacks, invoked by the storage service in order
pub trait UploadCallbacks: Send + Sync {
    fn on_upload_complete(&self, commp: &str);

    fn on_root_added(&self, transaction: Option<&TransactionInfo>);

    fn on_root_confirmed(&self, root_ids: &[u64]);
}

/// Listener for storage service creation lifecycle notifications
pub trait ServiceEventListener: Send + Sync {
    fn on_event(&self, event: &ServiceEvent);
}

/// Opens sessions against the storage network
#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(
        &self,
        signer: Arc<dyn WalletSigner>,
        options: SessionOptions,
    ) -> Result<Arc<dyn StorageSession>>;
}

/// A live session bound to one signer
#[async_trait]
pub trait StorageSession: Send + Sync {
    fn network(&self) -> Network;

    fn signer_address(&self) -> &str;

    /// All proof sets the client holds with the storage service
    async fn client_proof_sets(&self, address: &str) -> Result<Vec<ProofSet>>;

    async fn provider_id_by_address(&self, payee: &str) -> Result<u64>;

    /// Create a provider-bound storage service, reporting lifecycle events to `listener`
    async fn create_storage(
        &self,
        provider_id: Option<u64>,
        listener: Arc<dyn ServiceEventListener>,
    ) -> Result<Arc<dyn StorageService>>;

    /// USDFC held in the wallet itself
    async fn wallet_balance(&self) -> Result<TokenAmount>;

    /// USDFC deposited in the payments contract and not locked
    async fn available_funds(&self) -> Result<TokenAmount>;

    async fn service_allowance(&self) -> Result<ServiceAllowance>;

    async fn storage_pricing(&self) -> Result<StoragePricing>;

    /// Deposit into the payments contract; resolves once the transaction is mined
    async fn deposit(&self, amount: TokenAmount) -> Result<TransactionInfo>;

    /// Approve the storage service to spend at the given rate and lockup
    async fn approve_service(
        &self,
        rate_allowance: TokenAmount,
        lockup_allowance: TokenAmount,
    ) -> Result<TransactionInfo>;
}

/// A provider-bound upload handle
#[async_trait]
pub trait StorageService: Send + Sync {
    fn provider_id(&self) -> u64;

    fn proof_set_id(&self) -> Option<u64>;

    async fn upload(&self, data: Vec<u8>, callbacks: &dyn UploadCallbacks) -> Result<UploadReceipt>;
}

/// Build the CDN retrieval URL for a piece stored by `wallet`
pub fn retrieval_url(wallet: &str, network: Network, commp: &str) -> Result<Url> {
    let wallet = wallet.trim().to_ascii_lowercase();
    let commp = commp.trim();
    if wallet.is_empty() || commp.is_empty() {
        return Err(Error::ValidationError(
            "wallet address and commp are required".to_string(),
        ));
    }
    Url::parse(&format!("https://{wallet}.{network}.filcdn.io/{commp}"))
        .map_err(|e| Error::ValidationError(format!("invalid retrieval url: {e}")))
}

/// Shorten an address for logs and status lines
pub fn truncate_address(address: &str) -> String {
    if address.len() <= 10 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}
