//! Storage service instance builder
//!
//! Creating a storage service may submit a proof-set creation transaction, so the
//! builder guarantees at most one creation in flight per (session, provider). Later
//! callers await the pending creation and receive the same instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{ServiceEventListener, StorageService, StorageSession};
use crate::error::{Error, Result};

/// Lifecycle notification emitted while a storage service is being created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServiceEvent {
    ProofSetResolved {
        proof_set_id: u64,
    },
    ProofSetCreationStarted {
        tx_hash: String,
        status_url: Option<String>,
    },
    ProofSetCreationProgress {
        transaction_mined: bool,
        transaction_success: bool,
        server_confirmed: bool,
        elapsed: Duration,
    },
    ProviderSelected {
        provider_id: u64,
        pdp_url: Option<String>,
    },
}

type ServiceResult = std::result::Result<Arc<dyn StorageService>, Arc<Error>>;
type PendingService = Shared<BoxFuture<'static, ServiceResult>>;

/// Memoization key: session identity plus the requested provider.
///
/// The session is identified by address, so every entry keeps its session alive
/// to stop the allocation from being reused by a later session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ServiceKey {
    session: usize,
    provider_id: Option<u64>,
}

impl ServiceKey {
    fn new(session: &Arc<dyn StorageSession>, provider_id: Option<u64>) -> Self {
        Self {
            session: Arc::as_ptr(session) as *const () as usize,
            provider_id,
        }
    }
}

struct Entry {
    _session: Arc<dyn StorageSession>,
    pending: PendingService,
}

#[derive(Default)]
pub struct StorageServiceBuilder {
    pending: Mutex<HashMap<ServiceKey, Entry>>,
}

impl StorageServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or join the creation of) the storage service for `session` and `provider_id`.
    ///
    /// Only the caller that starts the creation has its `listener` attached; joiners
    /// wait silently. A failed creation is reported to every waiter and then forgotten
    /// so a later call can try again.
    #[instrument(skip(self, session, listener), fields(provider_id = ?provider_id))]
    pub async fn create_service(
        &self,
        session: &Arc<dyn StorageSession>,
        provider_id: Option<u64>,
        listener: Arc<dyn ServiceEventListener>,
    ) -> Result<Arc<dyn StorageService>> {
        let key = ServiceKey::new(session, provider_id);
        let pending = {
            let mut map = self
                .pending
                .lock()
                .map_err(|_| Error::PreconditionError("service state poisoned".to_string()))?;
            map.entry(key)
                .or_insert_with(|| {
                    info!("Creating storage service");
                    let creator = session.clone();
                    let pending = async move {
                        creator
                            .create_storage(provider_id, listener)
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    Entry {
                        _session: session.clone(),
                        pending,
                    }
                })
                .pending
                .clone()
        };

        match pending.clone().await {
            Ok(service) => Ok(service),
            Err(e) => {
                warn!("Storage service creation failed: {}", e);
                if let Ok(mut map) = self.pending.lock() {
                    if map.get(&key).is_some_and(|e| e.pending.ptr_eq(&pending)) {
                        map.remove(&key);
                    }
                }
                Err(Error::SharedError(e))
            }
        }
    }

    /// The ready service for `session`/`provider_id`, without starting a creation
    pub fn ready(
        &self,
        session: &Arc<dyn StorageSession>,
        provider_id: Option<u64>,
    ) -> Option<Arc<dyn StorageService>> {
        let map = self.pending.lock().ok()?;
        let entry = map.get(&ServiceKey::new(session, provider_id))?;
        match entry.pending.peek() {
            Some(Ok(service)) => Some(service.clone()),
            _ => None,
        }
    }

    /// Forget every memoized service
    pub fn clear(&self) {
        if let Ok(mut map) = self.pending.lock() {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryNetwork;
    use crate::storage::{Network, SessionOptions, StaticSigner, StorageConnector};

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<ServiceEvent>>,
    }

    impl ServiceEventListener for RecordingListener {
        fn on_event(&self, event: &ServiceEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    async fn session(network: &Arc<InMemoryNetwork>) -> Arc<dyn StorageSession> {
        network
            .connect(
                Arc::new(StaticSigner::new("0xClient", 314159)),
                SessionOptions {
                    network: Network::Calibration,
                    with_cdn: true,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_creation_runs_once() {
        let network = Arc::new(InMemoryNetwork::new().with_latency(Duration::from_millis(25)));
        let session = session(&network).await;
        let builder = Arc::new(StorageServiceBuilder::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let builder = builder.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    builder
                        .create_service(&session, None, Arc::new(RecordingListener::default()))
                        .await
                })
            })
            .collect();

        let mut services = Vec::new();
        for handle in handles {
            services.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(network.services_created(), 1);
        assert!(services.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(builder.ready(&session, None).is_some());
    }

    #[tokio::test]
    async fn test_new_proof_set_emits_ordered_events() {
        let network = Arc::new(InMemoryNetwork::new());
        let session = session(&network).await;
        let builder = StorageServiceBuilder::new();
        let listener = Arc::new(RecordingListener::default());

        builder
            .create_service(&session, None, listener.clone())
            .await
            .unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert!(matches!(events[0], ServiceEvent::ProviderSelected { .. }));
        assert!(matches!(events[1], ServiceEvent::ProofSetCreationStarted { .. }));
        assert!(matches!(
            events[2],
            ServiceEvent::ProofSetCreationProgress {
                transaction_success: true,
                server_confirmed: false,
                ..
            }
        ));
        assert!(matches!(
            events[3],
            ServiceEvent::ProofSetCreationProgress {
                server_confirmed: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_memoized() {
        let network = Arc::new(InMemoryNetwork::new());
        network.fail_next_service_creation("provider unreachable");
        let session = session(&network).await;
        let builder = StorageServiceBuilder::new();

        let err = builder
            .create_service(&session, Some(7), Arc::new(RecordingListener::default()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "upload_transport");
        assert!(builder.ready(&session, Some(7)).is_none());

        builder
            .create_service(&session, Some(7), Arc::new(RecordingListener::default()))
            .await
            .unwrap();
        assert_eq!(network.services_created(), 1);
    }

    #[tokio::test]
    async fn test_services_stay_bound_to_their_session() {
        let network = Arc::new(InMemoryNetwork::new());
        let builder = StorageServiceBuilder::new();

        let first = session(&network).await;
        builder
            .create_service(&first, Some(3), Arc::new(RecordingListener::default()))
            .await
            .unwrap();
        let weak = Arc::downgrade(&first);
        drop(first);
        assert!(weak.upgrade().is_some(), "memoized service released its session");

        let second = session(&network).await;
        assert!(builder.ready(&second, Some(3)).is_none());

        builder.clear();
        assert!(weak.upgrade().is_none());
    }
}
