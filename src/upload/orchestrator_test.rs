//! Scenario tests for the upload orchestrator.
//!
//! Covers: size rejection before network activity, missing-session precondition,
//! the happy path with an existing proof set, first upload with proof-set creation,
//! the missing transaction-hash grace wait, preflight and transport failures,
//! progress monotonicity, and reset.

#[cfg(test)]
mod tests {
    use crate::config::StorageSettings;
    use crate::error::Error;
    use crate::storage::memory::InMemoryNetwork;
    use crate::storage::{
        Network, PreflightChecker, PreflightConfig, ProofSet, StaticSigner, StorageContext,
        StorageSession, TokenAmount, WalletSigner,
    };
    use crate::upload::{
        FileKind, UploadFile, UploadLimits, UploadObserver, UploadOrchestrator, UploadPhase,
        UploadState,
    };

    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio_test::{assert_err, assert_ok};

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    const CLIENT: &str = "0xC1ient000000000000000000000000000000001";
    const GRACE: Duration = Duration::from_millis(50);

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<UploadState>>,
    }

    impl UploadObserver for Recorder {
        fn on_state(&self, state: &UploadState) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    impl Recorder {
        fn phases(&self) -> Vec<UploadPhase> {
            let mut phases: Vec<UploadPhase> = Vec::new();
            for state in self.states.lock().unwrap().iter() {
                if phases.last() != Some(&state.phase) {
                    phases.push(state.phase);
                }
            }
            phases
        }

        fn progress(&self) -> Vec<u8> {
            self.states.lock().unwrap().iter().map(|s| s.progress).collect()
        }

        fn statuses(&self) -> Vec<String> {
            self.states
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.status_message.clone())
                .collect()
        }
    }

    fn existing_proof_set() -> ProofSet {
        ProofSet {
            pdp_verifier_proof_set_id: 11,
            payee: "0xprovider11".to_string(),
            current_root_count: 4,
            with_cdn: true,
        }
    }

    fn funded() -> InMemoryNetwork {
        InMemoryNetwork::new().with_allowance(
            TokenAmount::parse_units("1").unwrap(),
            TokenAmount::parse_units("1000").unwrap(),
        )
    }

    fn build(network: &Arc<InMemoryNetwork>) -> (Arc<StorageContext>, UploadOrchestrator, Arc<Recorder>) {
        let signer: Arc<dyn WalletSigner> = Arc::new(StaticSigner::new(CLIENT, 314159));
        let context = Arc::new(StorageContext::new(
            network.clone(),
            Some(signer),
            Network::Calibration,
            &StorageSettings::default(),
        ));
        let orchestrator = UploadOrchestrator::new(
            context.clone(),
            PreflightChecker::new(PreflightConfig::default()),
            UploadLimits::default(),
            GRACE,
        );
        let recorder = Arc::new(Recorder::default());
        orchestrator.add_observer(recorder.clone());
        (context, orchestrator, recorder)
    }

    async fn connected(network: &Arc<InMemoryNetwork>) -> (UploadOrchestrator, Arc<Recorder>) {
        let (context, orchestrator, recorder) = build(network);
        assert_ok!(context.connect().await);
        (orchestrator, recorder)
    }

    fn video(size: usize) -> UploadFile {
        UploadFile::new("clip.mp4", FileKind::Video, vec![7u8; size])
    }

    fn assert_monotonic(progress: &[u8]) {
        assert!(
            progress.windows(2).all(|w| w[0] <= w[1]),
            "progress went backwards: {progress:?}"
        );
    }

    // ---------------------------------------------------------------------
    // 1. Rejections before any network activity
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_oversized_files_are_rejected_before_network_calls() {
        let network = Arc::new(funded().with_proof_sets(vec![existing_proof_set()]));
        let (orchestrator, _) = connected(&network).await;

        let limits = UploadLimits::default();
        let image = UploadFile::new(
            "thumb.png",
            FileKind::Image,
            vec![0u8; limits.max_image_bytes as usize + 1],
        );
        let err = assert_err!(orchestrator.upload(image).await);
        assert!(matches!(err, Error::FileTooLargeError { .. }));

        assert_eq!(network.proof_set_queries(), 0);
        assert_eq!(network.services_created(), 0);
        assert_eq!(network.uploads(), 0);

        let state = orchestrator.state();
        assert_eq!(state.phase, UploadPhase::Failed);
        assert_eq!(state.progress, 0);
        assert_eq!(state.error.unwrap().kind, "file_too_large");
    }

    #[tokio::test]
    async fn test_upload_without_session_is_precondition_error() {
        let network = Arc::new(funded());
        let (_context, orchestrator, _) = build(&network);

        let err = assert_err!(orchestrator.upload(video(1024)).await);
        assert!(matches!(err, Error::PreconditionError(_)));
        assert_eq!(network.sessions_opened(), 0);
        assert_eq!(orchestrator.state().status_message, err.to_string());
    }

    // ---------------------------------------------------------------------
    // 2. Successful uploads
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_500mib_upload_with_existing_proof_set() {
        let network = Arc::new(funded().with_proof_sets(vec![existing_proof_set()]));
        let (orchestrator, recorder) = connected(&network).await;
        assert_ok!(orchestrator.prepare().await);

        let result = assert_ok!(orchestrator.upload(video(500 << 20)).await);

        assert!(!result.commp.is_empty());
        assert!(result.tx_hash.is_some());
        assert_eq!(result.file_size_bytes, 500 << 20);
        assert_eq!(
            recorder.phases(),
            vec![
                UploadPhase::Idle,
                UploadPhase::Preflighting,
                UploadPhase::Uploading,
                UploadPhase::ConfirmingOnChain,
                UploadPhase::Succeeded,
            ]
        );

        let state = orchestrator.state();
        assert_eq!(state.progress, 100);
        assert_eq!(state.result, Some(result));
        assert_eq!(network.deposits(), 0);
        assert_eq!(network.proof_sets()[0].current_root_count, 5);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_sub_events_ordered() {
        let network = Arc::new(funded().with_proof_sets(vec![existing_proof_set()]));
        let (orchestrator, recorder) = connected(&network).await;

        assert_ok!(orchestrator.upload(video(4096)).await);

        let progress = recorder.progress();
        assert_monotonic(&progress);
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));

        let statuses = recorder.statuses();
        let position = |needle: &str| {
            let hits: Vec<usize> = statuses
                .iter()
                .enumerate()
                .filter(|(_, s)| s.contains(needle))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(hits.len(), 1, "expected exactly one '{needle}' status");
            hits[0]
        };
        let uploaded = position("File uploaded!");
        let added = position("Waiting for transaction");
        let confirmed = position("Data roots added");
        assert!(uploaded < added && added < confirmed);
    }

    #[tokio::test]
    async fn test_first_upload_creates_proof_set() {
        let network = Arc::new(InMemoryNetwork::new());
        let (orchestrator, recorder) = connected(&network).await;

        let result = assert_ok!(orchestrator.upload(video(1 << 20)).await);
        assert!(result.tx_hash.is_some());

        let phases = recorder.phases();
        assert!(phases.contains(&UploadPhase::SettingUpService));
        assert!(recorder.progress().contains(&50));
        assert_monotonic(&recorder.progress());

        assert_eq!(network.deposits(), 1);
        assert_eq!(network.approvals(), 1);
        assert_eq!(network.services_created(), 1);
        assert_eq!(network.proof_sets().len(), 1);

        // The next file sees the new proof set and reuses the service
        recorder.states.lock().unwrap().clear();
        assert_ok!(orchestrator.upload(video(2 << 20)).await);
        assert_eq!(network.services_created(), 1);
        assert_eq!(
            recorder.phases(),
            vec![
                UploadPhase::Idle,
                UploadPhase::Preflighting,
                UploadPhase::Uploading,
                UploadPhase::ConfirmingOnChain,
                UploadPhase::Succeeded,
            ]
        );
        assert_eq!(network.proof_sets()[0].current_root_count, 2);
    }

    #[tokio::test]
    async fn test_second_upload_resolves_created_proof_set() {
        let network = Arc::new(InMemoryNetwork::new());
        let (context, orchestrator, _) = build(&network);
        let session = assert_ok!(context.connect().await);

        assert_eq!(assert_ok!(context.provider_id(session.as_ref()).await), None);
        assert_ok!(orchestrator.upload(video(4096)).await);

        let created = &network.proof_sets()[0];
        let provider = assert_ok!(context.provider_id(session.as_ref()).await);
        assert!(provider.is_some());
        assert_eq!(
            provider,
            Some(assert_ok!(session.provider_id_by_address(&created.payee).await))
        );
    }

    #[tokio::test]
    async fn test_missing_tx_hash_waits_grace_period() {
        let network = Arc::new(
            funded()
                .with_proof_sets(vec![existing_proof_set()])
                .without_tx_hash(),
        );
        let (orchestrator, _) = connected(&network).await;

        let started = Instant::now();
        let result = assert_ok!(orchestrator.upload(video(2048)).await);
        assert!(started.elapsed() >= GRACE);
        assert_eq!(result.tx_hash, None);
        assert_eq!(orchestrator.state().phase, UploadPhase::Succeeded);
    }

    // ---------------------------------------------------------------------
    // 3. Failures
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_insufficient_funds_aborts_before_transfer() {
        let network = Arc::new(
            InMemoryNetwork::new()
                .with_wallet_balance(TokenAmount::ZERO)
                .with_proof_sets(vec![existing_proof_set()]),
        );
        let (orchestrator, recorder) = connected(&network).await;

        let err = assert_err!(orchestrator.upload(video(1 << 20)).await);
        assert!(matches!(err, Error::InsufficientFundsError { .. }));
        assert_eq!(network.uploads(), 0);

        let state = orchestrator.state();
        assert_eq!(state.phase, UploadPhase::Failed);
        assert_eq!(state.progress, 0);
        assert_eq!(state.status_message, err.to_string());
        assert!(!recorder.phases().contains(&UploadPhase::Uploading));
    }

    #[tokio::test]
    async fn test_transport_failure_resets_progress() {
        let network = Arc::new(
            funded()
                .with_proof_sets(vec![existing_proof_set()])
                .fail_uploads("connection reset by provider"),
        );
        let (orchestrator, recorder) = connected(&network).await;

        let err = assert_err!(orchestrator.upload(video(1024)).await);
        assert!(matches!(err, Error::UploadTransportError(_)));

        let state = orchestrator.state();
        assert_eq!(state.phase, UploadPhase::Failed);
        assert_eq!(state.progress, 0);
        assert!(state.status_message.contains("connection reset by provider"));
        assert_eq!(state.error.unwrap().kind, "upload_transport");

        // Everything up to the failure was still monotonic
        let progress = recorder.progress();
        assert_monotonic(&progress[..progress.len() - 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_upload_is_rejected() {
        let network = Arc::new(InMemoryNetwork::new().with_latency(Duration::from_millis(100)));
        let (orchestrator, _) = connected(&network).await;

        let (first, second) = tokio::join!(
            orchestrator.upload(video(1024)),
            orchestrator.upload(video(2048)),
        );
        assert_ok!(first);
        let err = assert_err!(second);
        assert!(matches!(err, Error::PreconditionError(_)));

        // The rejected call left the running attempt alone
        let state = orchestrator.state();
        assert_eq!(state.phase, UploadPhase::Succeeded);
        assert_eq!(state.result.unwrap().file_size_bytes, 1024);
        assert_eq!(network.uploads(), 1);

        // The slot is released afterwards
        assert_ok!(orchestrator.upload(video(2048)).await);
    }

    // ---------------------------------------------------------------------
    // 4. Reset
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_reset_clears_state_and_allows_retry() {
        let network = Arc::new(funded().with_proof_sets(vec![existing_proof_set()]));
        let (orchestrator, _) = connected(&network).await;
        let mut rx = orchestrator.subscribe();

        assert_ok!(orchestrator.upload(video(1024)).await);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, UploadPhase::Succeeded);

        orchestrator.reset();
        assert_eq!(orchestrator.state(), UploadState::default());

        assert_ok!(orchestrator.upload(video(1024)).await);
        assert_eq!(network.uploads(), 2);
    }
}
