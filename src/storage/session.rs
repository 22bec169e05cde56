//! Storage session manager
//!
//! Opening a session is expensive and stateful (nonce tracking, contract discovery),
//! so exactly one session is kept per signer. Concurrent callers share the same
//! in-flight connection attempt.

use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{info, instrument};

use super::{truncate_address, SessionOptions, StorageConnector, StorageSession, WalletSigner};
use crate::error::{Error, Result};

/// Identity of a signer for memoization purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignerKey {
    address: String,
    chain_id: u64,
}

impl SignerKey {
    fn of(signer: &dyn WalletSigner) -> Self {
        Self {
            address: signer.address().to_ascii_lowercase(),
            chain_id: signer.chain_id(),
        }
    }
}

struct SessionSlot {
    key: SignerKey,
    cell: Arc<OnceCell<Arc<dyn StorageSession>>>,
}

pub struct SessionManager {
    connector: Arc<dyn StorageConnector>,
    options: SessionOptions,
    slot: Mutex<Option<SessionSlot>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn StorageConnector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            slot: Mutex::new(None),
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Return the session for `signer`, opening it on first use.
    ///
    /// A different signer replaces the memoized session; the same signer always gets
    /// the same session back.
    #[instrument(skip_all)]
    pub async fn get_or_create_session(
        &self,
        signer: Option<&Arc<dyn WalletSigner>>,
    ) -> Result<Arc<dyn StorageSession>> {
        let signer = signer.ok_or_else(|| {
            Error::SessionInitError("signer not available for session initialization".to_string())
        })?;
        let key = SignerKey::of(signer.as_ref());
        let cell = self.cell_for(&key)?;

        let session = cell
            .get_or_try_init(|| async {
                info!(
                    "Opening storage session for {} on {}",
                    truncate_address(&key.address),
                    self.options.network
                );
                self.connector
                    .connect(signer.clone(), self.options)
                    .await
                    .map_err(|e| match e {
                        Error::SessionInitError(_) => e,
                        other => Error::SessionInitError(other.to_string()),
                    })
            })
            .await?;
        Ok(session.clone())
    }

    /// The live session, if one has been opened
    pub fn current(&self) -> Option<Arc<dyn StorageSession>> {
        let slot = self.slot.lock().ok()?;
        slot.as_ref().and_then(|s| s.cell.get().cloned())
    }

    /// Forget the session, e.g. on wallet disconnect
    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.take().is_some() {
                info!("Storage session cleared");
            }
        }
    }

    fn cell_for(&self, key: &SignerKey) -> Result<Arc<OnceCell<Arc<dyn StorageSession>>>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::SessionInitError("session state poisoned".to_string()))?;
        match slot.as_ref() {
            Some(existing) if existing.key == *key => Ok(existing.cell.clone()),
            _ => {
                let cell = Arc::new(OnceCell::new());
                *slot = Some(SessionSlot {
                    key: key.clone(),
                    cell: cell.clone(),
                });
                Ok(cell)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryNetwork;
    use crate::storage::{Network, StaticSigner};

    fn manager(network: Arc<InMemoryNetwork>) -> SessionManager {
        SessionManager::new(
            network,
            SessionOptions {
                network: Network::Calibration,
                with_cdn: true,
            },
        )
    }

    fn signer(address: &str) -> Arc<dyn WalletSigner> {
        Arc::new(StaticSigner::new(address, 314159))
    }

    #[tokio::test]
    async fn test_missing_signer_is_session_init_error() {
        let sessions = manager(Arc::new(InMemoryNetwork::new()));
        let err = sessions.get_or_create_session(None).await.err().unwrap();
        assert!(matches!(err, Error::SessionInitError(_)));
        assert!(sessions.current().is_none());
    }

    #[tokio::test]
    async fn test_same_signer_reuses_session() {
        let network = Arc::new(InMemoryNetwork::new());
        let sessions = manager(network.clone());
        let alice = signer("0xAlice");

        let first = sessions.get_or_create_session(Some(&alice)).await.unwrap();
        let second = sessions
            .get_or_create_session(Some(&signer("0xalice")))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(network.sessions_opened(), 1);
        assert!(sessions.current().is_some());
    }

    #[tokio::test]
    async fn test_new_signer_replaces_session() {
        let network = Arc::new(InMemoryNetwork::new());
        let sessions = manager(network.clone());

        let alice = sessions
            .get_or_create_session(Some(&signer("0xAlice")))
            .await
            .unwrap();
        let bob = sessions
            .get_or_create_session(Some(&signer("0xBob")))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&alice, &bob));
        assert_eq!(bob.signer_address(), "0xBob");
        assert_eq!(network.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connection() {
        let network = Arc::new(InMemoryNetwork::new().with_latency(std::time::Duration::from_millis(20)));
        let sessions = Arc::new(manager(network.clone()));
        let alice = signer("0xAlice");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions = sessions.clone();
                let alice = alice.clone();
                tokio::spawn(async move { sessions.get_or_create_session(Some(&alice)).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(network.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_reconnect() {
        let network = Arc::new(InMemoryNetwork::new());
        let sessions = manager(network.clone());
        let alice = signer("0xAlice");

        sessions.get_or_create_session(Some(&alice)).await.unwrap();
        sessions.clear();
        assert!(sessions.current().is_none());
        sessions.get_or_create_session(Some(&alice)).await.unwrap();
        assert_eq!(network.sessions_opened(), 2);
    }
}
