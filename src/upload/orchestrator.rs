//! Upload orchestrator
//!
//! Drives one file through
//! `Idle -> Preflighting -> SettingUpService -> Uploading -> ConfirmingOnChain -> Succeeded`,
//! with `Failed` reachable from every non-terminal phase. Phases run strictly in
//! sequence and progress never decreases within an attempt.
//!
//! ## Progress values
//! - 5 / 10 / 20: balance read, deposit made, service approved
//! - 25..=50: storage service setup (only when no service exists yet)
//! - 55 / 75 / 80 / 85: transfer started, upload complete, root added, root confirmed
//! - 95: confirmation done, 100: succeeded; a failure resets progress to 0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{ErrorInfo, UploadFile, UploadLimits, UploadPhase, UploadResult, UploadState};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::preflight::ProgressSink;
use crate::storage::{
    PreflightChecker, ServiceEvent, ServiceEventListener, StorageContext, TransactionInfo,
    UploadCallbacks,
};

/// Receives every state transition of an orchestrator, in order
pub trait UploadObserver: Send + Sync {
    fn on_state(&self, state: &UploadState);
}

/// Shared, observable upload state
struct StateHandle {
    tx: watch::Sender<UploadState>,
    observers: Mutex<Vec<Arc<dyn UploadObserver>>>,
}

impl StateHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(UploadState::default());
        Self {
            tx,
            observers: Mutex::new(Vec::new()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut UploadState)) {
        let mut snapshot = UploadState::default();
        self.tx.send_modify(|state| {
            f(state);
            snapshot = state.clone();
        });
        let observers = match self.observers.lock() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_state(&snapshot);
        }
    }

    fn replace(&self, state: UploadState) {
        self.update(|s| *s = state);
    }

    fn enter(&self, phase: UploadPhase, status: &str, progress: u8) {
        debug!("Entering {}", phase);
        self.update(|s| {
            s.phase = phase;
            s.status_message = status.to_string();
            s.progress = s.progress.max(progress);
        });
    }

    fn set_status(&self, status: String, progress: Option<u8>) {
        self.update(|s| {
            s.status_message = status;
            if let Some(p) = progress {
                s.progress = s.progress.max(p.min(100));
            }
        });
    }
}

impl ProgressSink for StateHandle {
    fn status(&self, message: &str) {
        self.set_status(message.to_string(), None);
    }

    fn progress(&self, value: u8) {
        // Preflight owns the lower half of the bar
        self.update(|s| s.progress = s.progress.max(value.min(50)));
    }
}

impl ServiceEventListener for StateHandle {
    fn on_event(&self, event: &ServiceEvent) {
        match event {
            ServiceEvent::ProofSetResolved { .. } => {
                self.set_status("🔗 Existing proof set found and resolved".to_string(), Some(30));
            }
            ServiceEvent::ProofSetCreationStarted { .. } => {
                self.set_status("🏗️ Creating new proof set on blockchain...".to_string(), Some(35));
            }
            ServiceEvent::ProofSetCreationProgress {
                transaction_success,
                server_confirmed,
                elapsed,
                ..
            } => {
                if *transaction_success {
                    self.set_status("⛓️ Proof set transaction confirmed on chain".to_string(), Some(45));
                }
                if *server_confirmed {
                    self.set_status(
                        format!("🎉 Proof set ready! ({}s)", elapsed.as_secs()),
                        Some(50),
                    );
                }
            }
            ServiceEvent::ProviderSelected { provider_id, .. } => {
                self.set_status(format!("🏪 Storage provider {provider_id} selected"), None);
            }
        }
    }
}

/// Logs service setup events when no upload is observing them
struct TracingListener;

impl ServiceEventListener for TracingListener {
    fn on_event(&self, event: &ServiceEvent) {
        info!(?event, "Storage service setup");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SubEvent {
    Started,
    UploadComplete,
    RootAdded,
    RootConfirmed,
}

/// Forwards upload sub-events into the state, enforcing their order
struct SubEventTracker<'a> {
    state: &'a StateHandle,
    last: Mutex<SubEvent>,
    tx_hash: Mutex<Option<String>>,
}

impl<'a> SubEventTracker<'a> {
    fn new(state: &'a StateHandle) -> Self {
        Self {
            state,
            last: Mutex::new(SubEvent::Started),
            tx_hash: Mutex::new(None),
        }
    }

    /// Move from `expected` to `next`; anything else is a duplicate or out of order
    fn step(&self, expected: SubEvent, next: SubEvent) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        if *last != expected {
            warn!("Ignoring {:?} received after {:?}", next, *last);
            return false;
        }
        *last = next;
        true
    }

    fn last(&self) -> SubEvent {
        self.last.lock().map(|l| *l).unwrap_or(SubEvent::Started)
    }

    fn tx_hash(&self) -> Option<String> {
        self.tx_hash.lock().ok().and_then(|h| h.clone())
    }
}

impl UploadCallbacks for SubEventTracker<'_> {
    fn on_upload_complete(&self, commp: &str) {
        if self.step(SubEvent::Started, SubEvent::UploadComplete) {
            debug!("Upload complete: {}", commp);
            self.state.set_status(
                "📊 File uploaded! Signing msg to add roots to the proof set".to_string(),
                Some(75),
            );
        }
    }

    fn on_root_added(&self, transaction: Option<&TransactionInfo>) {
        if !self.step(SubEvent::UploadComplete, SubEvent::RootAdded) {
            return;
        }
        let status = match transaction {
            Some(tx) => {
                if let Ok(mut hash) = self.tx_hash.lock() {
                    *hash = Some(tx.hash.clone());
                }
                format!("🔄 Waiting for transaction to be confirmed on chain (txHash: {})", tx.hash)
            }
            None => "🔄 Waiting for transaction to be confirmed on chain".to_string(),
        };
        self.state.set_status(status, Some(80));
    }

    fn on_root_confirmed(&self, root_ids: &[u64]) {
        if self.step(SubEvent::RootAdded, SubEvent::RootConfirmed) {
            debug!("Roots confirmed: {:?}", root_ids);
            self.state.set_status(
                "🌳 Data roots added to proof set successfully".to_string(),
                Some(85),
            );
        }
    }
}

pub struct UploadOrchestrator {
    context: Arc<StorageContext>,
    preflight: PreflightChecker,
    limits: UploadLimits,
    tx_grace_period: Duration,
    state: Arc<StateHandle>,
    running: AtomicBool,
}

/// Releases the orchestrator's single upload slot when dropped
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UploadOrchestrator {
    pub fn new(
        context: Arc<StorageContext>,
        preflight: PreflightChecker,
        limits: UploadLimits,
        tx_grace_period: Duration,
    ) -> Self {
        Self {
            context,
            preflight,
            limits,
            tx_grace_period,
            state: Arc::new(StateHandle::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(context: Arc<StorageContext>, config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            context,
            PreflightChecker::new(config.preflight_config()?),
            config.upload_limits(),
            Duration::from_millis(config.storage.tx_grace_period_ms),
        ))
    }

    pub fn add_observer(&self, observer: Arc<dyn UploadObserver>) {
        if let Ok(mut observers) = self.state.observers.lock() {
            observers.push(observer);
        }
    }

    /// Watch the latest state; intermediate states may be coalesced
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.tx.subscribe()
    }

    pub fn state(&self) -> UploadState {
        self.state.tx.borrow().clone()
    }

    /// Clear progress, status and result. An upload already running is not cancelled.
    pub fn reset(&self) {
        self.state.replace(UploadState::default());
    }

    /// Connect the session and build the storage service ahead of the first upload
    pub async fn prepare(&self) -> Result<()> {
        self.context.prepare_service(Arc::new(TracingListener)).await?;
        Ok(())
    }

    /// Upload one file, returning the stored piece on success.
    ///
    /// Any failure moves the state to `Failed` with the error message as status,
    /// except a call made while another upload is running, which is rejected as is.
    #[instrument(skip(self, file), fields(file = %file.name, size = file.size(), kind = %file.kind))]
    pub async fn upload(&self, file: UploadFile) -> Result<UploadResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::PreconditionError(format!(
                "an upload is already in progress ({})",
                self.state().phase
            )));
        }
        let _running = RunningGuard(&self.running);

        let kind = file.kind;
        let size = file.size();
        let started = Instant::now();

        let outcome = self.run(file).await;
        match &outcome {
            Ok(result) => {
                info!("Stored {} as {}", result.file_name, result.commp);
                metrics::record_upload(kind, "succeeded", size, started.elapsed());
            }
            Err(e) => {
                warn!("Upload failed: {}", e);
                self.state.update(|s| {
                    s.phase = UploadPhase::Failed;
                    s.progress = 0;
                    s.status_message = e.to_string();
                    s.result = None;
                    s.error = Some(ErrorInfo::from(e));
                });
                metrics::record_upload(kind, e.kind(), size, started.elapsed());
            }
        }
        outcome
    }

    async fn run(&self, file: UploadFile) -> Result<UploadResult> {
        let UploadFile { name, kind, bytes } = file;
        let size = bytes.len() as u64;

        self.state.replace(UploadState {
            status_message: "🔄 Initializing file upload to Filecoin...".to_string(),
            ..UploadState::default()
        });

        // Rejected before any network activity
        self.limits.check(&name, kind, size)?;
        let session = self.context.session().ok_or_else(|| {
            Error::PreconditionError(
                "storage session not initialized; connect a wallet first".to_string(),
            )
        })?;

        self.state.enter(
            UploadPhase::Preflighting,
            "💰 Checking USDFC balance and storage allowances...",
            0,
        );
        let provider_id = self.context.provider_id(session.as_ref()).await?;
        self.preflight
            .check(
                size,
                session.as_ref(),
                self.context.network(),
                provider_id.is_some(),
                self.state.as_ref(),
            )
            .await?;

        let service = match self.context.ready_service(provider_id) {
            Some(service) => service,
            None => {
                self.state.enter(
                    UploadPhase::SettingUpService,
                    "🔗 Setting up storage service and proof set...",
                    25,
                );
                self.context.prepare_service(self.state.clone()).await?
            }
        };

        self.state.enter(
            UploadPhase::Uploading,
            "📁 Uploading file to storage provider...",
            55,
        );
        let tracker = SubEventTracker::new(self.state.as_ref());
        let receipt = service.upload(bytes, &tracker).await?;
        if tracker.last() != SubEvent::RootConfirmed {
            debug!("Provider finished after {:?}", tracker.last());
        }

        self.state.enter(
            UploadPhase::ConfirmingOnChain,
            "⛓️ Waiting for on-chain confirmation...",
            85,
        );
        let tx_hash = tracker.tx_hash();
        if tx_hash.is_none() {
            // Best effort only: nothing is polled during this wait
            warn!(
                "Transaction hash not reported by provider; waiting {:?} before declaring success",
                self.tx_grace_period
            );
            tokio::time::sleep(self.tx_grace_period).await;
        }
        self.state.set_status("⛓️ Confirmation window elapsed".to_string(), Some(95));

        let result = UploadResult {
            file_name: name,
            file_size_bytes: size,
            commp: receipt.commp,
            tx_hash,
        };
        self.state.update(|s| {
            s.phase = UploadPhase::Succeeded;
            s.progress = 100;
            s.status_message = "🎉 File successfully stored on Filecoin!".to_string();
            s.result = Some(result.clone());
            s.error = None;
        });
        Ok(result)
    }
}
