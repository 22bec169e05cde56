//! In-memory storage network
//!
//! Simulates sessions, proof sets, payments and uploads without touching a chain.
//! Used by `filtube upload --dry-run` and throughout the test-suite. Piece
//! commitments are derived from a SHA-256 of the bytes, not real CommP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    Network, ProofSet, ServiceAllowance, ServiceEvent, ServiceEventListener, SessionOptions,
    StorageConnector, StoragePricing, StorageService, StorageSession, TokenAmount,
    TransactionInfo, UploadCallbacks, UploadReceipt, WalletSigner,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: usize,
    proof_set_queries: usize,
    services_created: usize,
    deposits: usize,
    approvals: usize,
    uploads: usize,
}

#[derive(Debug)]
struct State {
    proof_sets: Vec<ProofSet>,
    providers: HashMap<String, u64>,
    pricing: StoragePricing,
    allowance: ServiceAllowance,
    wallet_balance: TokenAmount,
    available_funds: TokenAmount,
    approval_cap: Option<TokenAmount>,
    fail_next_service: Option<String>,
    fail_uploads: Option<String>,
    report_tx_hash: bool,
    next_tx: u64,
    next_root: u64,
    counters: Counters,
}

impl State {
    fn tx(&mut self) -> TransactionInfo {
        self.next_tx += 1;
        TransactionInfo {
            hash: format!("0x{:064x}", self.next_tx),
        }
    }

    fn provider_for(&mut self, payee: &str) -> u64 {
        let next = self.providers.len() as u64 + 1;
        *self.providers.entry(payee.to_ascii_lowercase()).or_insert(next)
    }
}

const SAMPLE: usize = 64 * 1024;

/// Identifier from the length and the head and tail of the data, so large dry runs stay fast
fn sampled_commp(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(&data[..data.len().min(SAMPLE)]);
    hasher.update(&data[data.len().saturating_sub(SAMPLE)..]);
    let digest = hex::encode(hasher.finalize());
    format!("baga6ea4seaq{}", &digest[..52])
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct InMemoryNetwork {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        let usdfc = |whole: u128| TokenAmount(whole * 10u128.pow(TokenAmount::DECIMALS));
        Self {
            state: Arc::new(Mutex::new(State {
                proof_sets: Vec::new(),
                providers: HashMap::new(),
                pricing: StoragePricing {
                    price_per_tib_per_month_no_cdn: usdfc(2),
                    price_per_tib_per_month_with_cdn: usdfc(3),
                    epochs_per_month: 86_400,
                },
                allowance: ServiceAllowance::default(),
                wallet_balance: usdfc(100),
                available_funds: TokenAmount::ZERO,
                approval_cap: None,
                fail_next_service: None,
                fail_uploads: None,
                report_tx_hash: true,
                next_tx: 0,
                next_root: 0,
                counters: Counters::default(),
            })),
            latency: Duration::ZERO,
        }
    }

    pub fn with_proof_sets(self, proof_sets: Vec<ProofSet>) -> Self {
        {
            let mut state = lock(&self.state);
            for p in &proof_sets {
                state.provider_for(&p.payee);
            }
            state.proof_sets = proof_sets;
        }
        self
    }

    /// Delay applied to connecting and to service creation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_pricing(self, pricing: StoragePricing) -> Self {
        lock(&self.state).pricing = pricing;
        self
    }

    pub fn with_allowance(self, rate: TokenAmount, lockup: TokenAmount) -> Self {
        {
            let mut state = lock(&self.state);
            state.allowance.rate_allowance = rate;
            state.allowance.lockup_allowance = lockup;
        }
        self
    }

    pub fn with_wallet_balance(self, balance: TokenAmount) -> Self {
        lock(&self.state).wallet_balance = balance;
        self
    }

    pub fn with_available_funds(self, funds: TokenAmount) -> Self {
        lock(&self.state).available_funds = funds;
        self
    }

    /// Approvals never exceed `cap`, as if the wallet edited the amounts
    pub fn with_approval_cap(self, cap: TokenAmount) -> Self {
        lock(&self.state).approval_cap = Some(cap);
        self
    }

    /// Providers accept roots without returning the transaction
    pub fn without_tx_hash(self) -> Self {
        lock(&self.state).report_tx_hash = false;
        self
    }

    pub fn fail_uploads(self, message: &str) -> Self {
        lock(&self.state).fail_uploads = Some(message.to_string());
        self
    }

    pub fn fail_next_service_creation(&self, message: &str) {
        lock(&self.state).fail_next_service = Some(message.to_string());
    }

    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).counters.sessions_opened
    }

    pub fn proof_set_queries(&self) -> usize {
        lock(&self.state).counters.proof_set_queries
    }

    pub fn services_created(&self) -> usize {
        lock(&self.state).counters.services_created
    }

    pub fn deposits(&self) -> usize {
        lock(&self.state).counters.deposits
    }

    pub fn approvals(&self) -> usize {
        lock(&self.state).counters.approvals
    }

    pub fn uploads(&self) -> usize {
        lock(&self.state).counters.uploads
    }

    pub fn proof_sets(&self) -> Vec<ProofSet> {
        lock(&self.state).proof_sets.clone()
    }
}

#[async_trait]
impl StorageConnector for InMemoryNetwork {
    async fn connect(
        &self,
        signer: Arc<dyn WalletSigner>,
        options: SessionOptions,
    ) -> Result<Arc<dyn StorageSession>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if signer.chain_id() != options.network.chain_id() {
            return Err(Error::SessionInitError(format!(
                "signer is on chain {} but {} expects {}",
                signer.chain_id(),
                options.network,
                options.network.chain_id()
            )));
        }
        lock(&self.state).counters.sessions_opened += 1;
        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            latency: self.latency,
            address: signer.address().to_string(),
            options,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    latency: Duration,
    address: String,
    options: SessionOptions,
}

#[async_trait]
impl StorageSession for MemorySession {
    fn network(&self) -> Network {
        self.options.network
    }

    fn signer_address(&self) -> &str {
        &self.address
    }

    async fn client_proof_sets(&self, _address: &str) -> Result<Vec<ProofSet>> {
        let mut state = lock(&self.state);
        state.counters.proof_set_queries += 1;
        Ok(state.proof_sets.clone())
    }

    async fn provider_id_by_address(&self, payee: &str) -> Result<u64> {
        Ok(lock(&self.state).provider_for(payee))
    }

    async fn create_storage(
        &self,
        provider_id: Option<u64>,
        listener: Arc<dyn ServiceEventListener>,
    ) -> Result<Arc<dyn StorageService>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut events = Vec::new();
        let service = {
            let mut state = lock(&self.state);
            if let Some(message) = state.fail_next_service.take() {
                return Err(Error::UploadTransportError(message));
            }

            let with_cdn = self.options.with_cdn;
            let existing = provider_id.and_then(|id| {
                state
                    .proof_sets
                    .iter()
                    .find(|p| {
                        p.with_cdn == with_cdn
                            && state.providers.get(&p.payee.to_ascii_lowercase()) == Some(&id)
                    })
                    .cloned()
            });

            let (provider_id, proof_set_id) = match existing {
                Some(proof_set) => {
                    let provider_id = provider_id.unwrap_or_default();
                    events.push(ServiceEvent::ProviderSelected {
                        provider_id,
                        pdp_url: None,
                    });
                    events.push(ServiceEvent::ProofSetResolved {
                        proof_set_id: proof_set.pdp_verifier_proof_set_id,
                    });
                    (provider_id, proof_set.pdp_verifier_proof_set_id)
                }
                None => {
                    let payee = format!("0xprovider{}", provider_id.unwrap_or(1));
                    let provider_id = state.provider_for(&payee);
                    let proof_set_id = state.proof_sets.len() as u64 + 1;
                    let tx = state.tx();
                    state.proof_sets.push(ProofSet {
                        pdp_verifier_proof_set_id: proof_set_id,
                        payee,
                        current_root_count: 0,
                        with_cdn,
                    });
                    events.push(ServiceEvent::ProviderSelected {
                        provider_id,
                        pdp_url: None,
                    });
                    events.push(ServiceEvent::ProofSetCreationStarted {
                        tx_hash: tx.hash,
                        status_url: None,
                    });
                    events.push(ServiceEvent::ProofSetCreationProgress {
                        transaction_mined: true,
                        transaction_success: true,
                        server_confirmed: false,
                        elapsed: Duration::from_secs(12),
                    });
                    events.push(ServiceEvent::ProofSetCreationProgress {
                        transaction_mined: true,
                        transaction_success: true,
                        server_confirmed: true,
                        elapsed: Duration::from_secs(30),
                    });
                    (provider_id, proof_set_id)
                }
            };

            state.counters.services_created += 1;
            MemoryService {
                state: self.state.clone(),
                provider_id,
                proof_set_id,
            }
        };

        for event in &events {
            listener.on_event(event);
        }
        Ok(Arc::new(service))
    }

    async fn wallet_balance(&self) -> Result<TokenAmount> {
        Ok(lock(&self.state).wallet_balance)
    }

    async fn available_funds(&self) -> Result<TokenAmount> {
        Ok(lock(&self.state).available_funds)
    }

    async fn service_allowance(&self) -> Result<ServiceAllowance> {
        Ok(lock(&self.state).allowance)
    }

    async fn storage_pricing(&self) -> Result<StoragePricing> {
        Ok(lock(&self.state).pricing)
    }

    async fn deposit(&self, amount: TokenAmount) -> Result<TransactionInfo> {
        let mut state = lock(&self.state);
        if state.wallet_balance < amount {
            return Err(Error::InsufficientFundsError {
                required: amount,
                available: state.wallet_balance,
            });
        }
        state.wallet_balance = state.wallet_balance.saturating_sub(amount);
        state.available_funds = state.available_funds.saturating_add(amount);
        state.counters.deposits += 1;
        Ok(state.tx())
    }

    async fn approve_service(
        &self,
        rate_allowance: TokenAmount,
        lockup_allowance: TokenAmount,
    ) -> Result<TransactionInfo> {
        let mut state = lock(&self.state);
        let cap = state.approval_cap.unwrap_or(TokenAmount(u128::MAX));
        state.allowance.rate_allowance = rate_allowance.min(cap);
        state.allowance.lockup_allowance = lockup_allowance.min(cap);
        state.counters.approvals += 1;
        Ok(state.tx())
    }
}

struct MemoryService {
    state: Arc<Mutex<State>>,
    provider_id: u64,
    proof_set_id: u64,
}

#[async_trait]
impl StorageService for MemoryService {
    fn provider_id(&self) -> u64 {
        self.provider_id
    }

    fn proof_set_id(&self) -> Option<u64> {
        Some(self.proof_set_id)
    }

    async fn upload(&self, data: Vec<u8>, callbacks: &dyn UploadCallbacks) -> Result<UploadReceipt> {
        if let Some(message) = lock(&self.state).fail_uploads.clone() {
            return Err(Error::UploadTransportError(message));
        }

        let commp = sampled_commp(&data);
        callbacks.on_upload_complete(&commp);

        let (tx, root_id) = {
            let mut state = lock(&self.state);
            state.counters.uploads += 1;
            state.next_root += 1;
            let root_id = state.next_root;
            if let Some(p) = state
                .proof_sets
                .iter_mut()
                .find(|p| p.pdp_verifier_proof_set_id == self.proof_set_id)
            {
                p.current_root_count += 1;
            }
            let tx = state.tx();
            (state.report_tx_hash.then_some(tx), root_id)
        };
        callbacks.on_root_added(tx.as_ref());
        callbacks.on_root_confirmed(&[root_id]);

        debug!("Stored {} bytes as {}", data.len(), commp);
        Ok(UploadReceipt {
            commp,
            size: data.len() as u64,
            root_id: Some(root_id),
        })
    }
}
