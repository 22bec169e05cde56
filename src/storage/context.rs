//! Per-wallet storage context
//!
//! Holds the session, the proof-set resolution and the storage service for one
//! wallet connection. Build one when the wallet connects and drop it (or call
//! [`StorageContext::disconnect`]) when it goes away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument};

use super::{
    truncate_address, Network, ProofSetResolver, ServiceEventListener, SessionManager,
    SessionOptions, StorageConnector, StorageService, StorageServiceBuilder, StorageSession,
    WalletSigner,
};
use crate::config::StorageSettings;
use crate::error::{Error, Result};

pub struct StorageContext {
    signer: Option<Arc<dyn WalletSigner>>,
    network: Network,
    sessions: SessionManager,
    resolver: ProofSetResolver,
    services: StorageServiceBuilder,
    /// Last service built for this wallet
    service: Mutex<Option<Arc<dyn StorageService>>>,
}

impl StorageContext {
    pub fn new(
        connector: Arc<dyn StorageConnector>,
        signer: Option<Arc<dyn WalletSigner>>,
        network: Network,
        settings: &StorageSettings,
    ) -> Self {
        let options = SessionOptions {
            network,
            with_cdn: settings.with_cdn,
        };
        Self {
            signer,
            network,
            sessions: SessionManager::new(connector, options),
            resolver: ProofSetResolver::new(
                settings.with_cdn,
                Duration::from_secs(settings.proof_set_cache_ttl_secs),
                settings.proof_set_cache_capacity,
            ),
            services: StorageServiceBuilder::new(),
            service: Mutex::new(None),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn with_cdn(&self) -> bool {
        self.resolver.with_cdn()
    }

    pub fn signer_address(&self) -> Option<&str> {
        self.signer.as_deref().map(|s| s.address())
    }

    /// Open (or reuse) the session for the connected signer
    pub async fn connect(&self) -> Result<Arc<dyn StorageSession>> {
        self.sessions.get_or_create_session(self.signer.as_ref()).await
    }

    /// The open session, if [`connect`](Self::connect) has succeeded
    pub fn session(&self) -> Option<Arc<dyn StorageSession>> {
        self.sessions.current()
    }

    /// Provider of the account's best proof set, or `None` when a new proof set
    /// will have to be created on first upload.
    ///
    /// Found proof sets are cached by the resolver for its TTL. A missing one is
    /// looked up again on every call.
    #[instrument(skip(self, session))]
    pub async fn provider_id(&self, session: &dyn StorageSession) -> Result<Option<u64>> {
        let address = self
            .signer_address()
            .ok_or_else(|| Error::PreconditionError("no wallet connected".to_string()))?;

        match self.resolver.resolve(session, self.network, address).await {
            Ok(resolved) => Ok(Some(resolved.provider_id)),
            Err(Error::NoProofSetFoundError { .. }) => {
                info!(
                    "No proof set for {}; a provider will be selected on first upload",
                    truncate_address(address)
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Build (or join the build of) the storage service for this wallet
    pub async fn prepare_service(
        &self,
        listener: Arc<dyn ServiceEventListener>,
    ) -> Result<Arc<dyn StorageService>> {
        let session = self.connect().await?;
        let provider_id = self.provider_id(session.as_ref()).await?;
        if let Some(service) = self.ready_service(provider_id) {
            return Ok(service);
        }
        let service = self
            .services
            .create_service(&session, provider_id, listener)
            .await?;
        if let Ok(mut slot) = self.service.lock() {
            *slot = Some(service.clone());
        }
        Ok(service)
    }

    /// The storage service for `provider_id`, if it has already been built.
    ///
    /// A service built before its proof set existed is bound to the provider the
    /// SDK selected, so it also serves that provider afterwards.
    pub fn ready_service(&self, provider_id: Option<u64>) -> Option<Arc<dyn StorageService>> {
        let session = self.session()?;
        if let Some(service) = self.services.ready(&session, provider_id) {
            return Some(service);
        }
        let built = self.service.lock().ok()?.clone()?;
        match provider_id {
            Some(id) if built.provider_id() != id => None,
            _ => Some(built),
        }
    }

    /// Forget everything tied to the wallet connection
    pub fn disconnect(&self) {
        self.sessions.clear();
        self.services.clear();
        self.resolver.invalidate();
        if let Ok(mut slot) = self.service.lock() {
            *slot = None;
        }
    }
}
