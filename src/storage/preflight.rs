//! Preflight balance and allowance checks
//!
//! Before any bytes are sent the payer must have enough USDFC deposited and must
//! have approved the storage service to spend it at the rate the upload needs. When
//! the current allowance falls short the checker tops up the deposit and submits
//! a fresh approval, so it is a gate with side effects rather than a predicate.

use tracing::{info, instrument};

use super::{Network, ServiceAllowance, StoragePricing, StorageSession, TokenAmount};
use crate::error::{Error, Result};

/// Filecoin produces one epoch every 30 seconds
pub const EPOCHS_PER_DAY: u64 = 2880;

const TIB: u128 = 1 << 40;

/// Receives status lines and progress values while a phase runs
pub trait ProgressSink: Send + Sync {
    fn status(&self, message: &str);

    fn progress(&self, value: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightConfig {
    pub with_cdn: bool,
    /// How many days of storage must stay locked up for the upload
    pub lockup_days: u64,
    /// Charged once when the upload has to create a new proof set
    pub proof_set_creation_fee: TokenAmount,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            with_cdn: true,
            lockup_days: 10,
            proof_set_creation_fee: TokenAmount(100_000_000_000_000_000),
        }
    }
}

/// What the upload needs from the payments contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceRequirement {
    pub rate: TokenAmount,
    pub lockup: TokenAmount,
}

impl AllowanceRequirement {
    pub fn is_met_by(&self, allowance: &ServiceAllowance) -> bool {
        allowance.rate_allowance >= self.rate && allowance.lockup_allowance >= self.lockup
    }
}

pub struct PreflightChecker {
    config: PreflightConfig,
}

impl PreflightChecker {
    pub fn new(config: PreflightConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreflightConfig {
        &self.config
    }

    /// Storage rate per epoch for `size` bytes, rounded up
    pub fn rate_per_epoch(&self, pricing: &StoragePricing, size: u64) -> TokenAmount {
        let price = if self.config.with_cdn {
            pricing.price_per_tib_per_month_with_cdn
        } else {
            pricing.price_per_tib_per_month_no_cdn
        };
        let epochs = pricing.epochs_per_month.max(1) as u128;
        let numerator = price.0.saturating_mul(size as u128);
        let denominator = TIB * epochs;
        TokenAmount(numerator.div_ceil(denominator))
    }

    /// Total rate and lockup allowance required once this upload is added
    pub fn requirement(
        &self,
        pricing: &StoragePricing,
        allowance: &ServiceAllowance,
        size: u64,
        has_existing_proof_set: bool,
    ) -> AllowanceRequirement {
        let rate = self.rate_per_epoch(pricing, size);
        let lockup_epochs = (self.config.lockup_days * EPOCHS_PER_DAY) as u128;
        let mut lockup = TokenAmount(rate.0.saturating_mul(lockup_epochs));
        if !has_existing_proof_set {
            lockup = lockup.saturating_add(self.config.proof_set_creation_fee);
        }
        AllowanceRequirement {
            rate: allowance.rate_used.saturating_add(rate),
            lockup: allowance.lockup_used.saturating_add(lockup),
        }
    }

    /// Make sure the session can pay for storing `file_size` bytes.
    ///
    /// Progress stays within 0..=20: 5 once balances are read, 10 after a deposit,
    /// 20 after an approval.
    #[instrument(skip(self, session, sink), fields(network = %network))]
    pub async fn check(
        &self,
        file_size: u64,
        session: &dyn StorageSession,
        network: Network,
        has_existing_proof_set: bool,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        sink.status("💰 Checking USDFC balance and storage allowances...");
        sink.progress(5);

        let pricing = session.storage_pricing().await?;
        let allowance = session.service_allowance().await?;
        let needed = self.requirement(&pricing, &allowance, file_size, has_existing_proof_set);

        if needed.is_met_by(&allowance) {
            info!("Existing allowances cover the upload");
            return Ok(());
        }

        // The lockup is paid out of deposited funds, so top them up first
        let available = session.available_funds().await?;
        let lockup_increase = needed.lockup.saturating_sub(allowance.lockup_used);
        let shortfall = lockup_increase.saturating_sub(available);
        if shortfall > TokenAmount::ZERO {
            let wallet = session.wallet_balance().await?;
            if wallet < shortfall {
                return Err(Error::InsufficientFundsError {
                    required: shortfall,
                    available: wallet,
                });
            }
            sink.status("💰 Depositing USDFC to cover storage costs...");
            let tx = session.deposit(shortfall).await?;
            info!("Deposited {} in {}", shortfall, tx.hash);
            sink.status("💰 USDFC deposited successfully");
            sink.progress(10);
        }

        sink.status("💰 Approving storage service USDFC spending rates...");
        let tx = session.approve_service(needed.rate, needed.lockup).await?;
        info!(
            "Approved rate {} and lockup {} in {}",
            needed.rate, needed.lockup, tx.hash
        );

        let refreshed = session.service_allowance().await?;
        if !needed.is_met_by(&refreshed) {
            return Err(Error::InsufficientAllowanceError(format!(
                "need rate {} and lockup {}, approved rate {} and lockup {}",
                needed.rate, needed.lockup, refreshed.rate_allowance, refreshed.lockup_allowance
            )));
        }
        sink.status("💰 Storage service approved to spend USDFC");
        sink.progress(20);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryNetwork;
    use crate::storage::{SessionOptions, StaticSigner, StorageConnector};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<u8>>,
        statuses: Mutex<Vec<String>>,
    }

    impl ProgressSink for Recorder {
        fn status(&self, message: &str) {
            self.statuses.lock().unwrap().push(message.to_string());
        }

        fn progress(&self, value: u8) {
            self.progress.lock().unwrap().push(value);
        }
    }

    fn usdfc(value: &str) -> TokenAmount {
        TokenAmount::parse_units(value).unwrap()
    }

    fn pricing() -> StoragePricing {
        StoragePricing {
            price_per_tib_per_month_no_cdn: usdfc("2"),
            price_per_tib_per_month_with_cdn: usdfc("3"),
            epochs_per_month: 86_400,
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

    #[test]
    fn test_rate_rounds_up() {
        let checker = PreflightChecker::new(PreflightConfig::default());
        assert_eq!(checker.rate_per_epoch(&pricing(), 0), TokenAmount::ZERO);
        // 3 USDFC / TiB / month for one byte is ~31.6 base units per epoch
        assert_eq!(checker.rate_per_epoch(&pricing(), 1), TokenAmount(32));

        let full = checker.rate_per_epoch(&pricing(), 1 << 40);
        assert_eq!(full, TokenAmount(usdfc("3").0.div_ceil(86_400)));
    }

    #[test]
    fn test_requirement_adds_creation_fee_without_proof_set() {
        let checker = PreflightChecker::new(PreflightConfig::default());
        let allowance = ServiceAllowance::default();
        let with = checker.requirement(&pricing(), &allowance, 1 << 30, true);
        let without = checker.requirement(&pricing(), &allowance, 1 << 30, false);
        assert_eq!(with.rate, without.rate);
        assert_eq!(
            without.lockup,
            with.lockup.saturating_add(PreflightConfig::default().proof_set_creation_fee)
        );
    }

    #[tokio::test]
    async fn test_sufficient_allowance_passes_without_transactions() {
        let network = Arc::new(
            InMemoryNetwork::new()
                .with_pricing(pricing())
                .with_allowance(usdfc("1"), usdfc("1000")),
        );
        let session = session(&network).await;
        let checker = PreflightChecker::new(PreflightConfig::default());
        let recorder = Recorder::default();

        checker
            .check(1 << 20, session.as_ref(), Network::Calibration, true, &recorder)
            .await
            .unwrap();

        assert_eq!(*recorder.progress.lock().unwrap(), vec![5]);
        assert_eq!(network.deposits(), 0);
        assert_eq!(network.approvals(), 0);
    }

    #[tokio::test]
    async fn test_deposits_and_approves_when_short() {
        let network = Arc::new(
            InMemoryNetwork::new()
                .with_pricing(pricing())
                .with_wallet_balance(usdfc("50"))
                .with_available_funds(TokenAmount::ZERO),
        );
        let session = session(&network).await;
        let checker = PreflightChecker::new(PreflightConfig::default());
        let recorder = Recorder::default();

        checker
            .check(500 << 20, session.as_ref(), Network::Calibration, false, &recorder)
            .await
            .unwrap();

        assert_eq!(*recorder.progress.lock().unwrap(), vec![5, 10, 20]);
        assert_eq!(network.deposits(), 1);
        assert_eq!(network.approvals(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_wallet_balance_fails() {
        let network = Arc::new(
            InMemoryNetwork::new()
                .with_pricing(pricing())
                .with_wallet_balance(TokenAmount::ZERO)
                .with_available_funds(TokenAmount::ZERO),
        );
        let session = session(&network).await;
        let checker = PreflightChecker::new(PreflightConfig::default());

        let err = checker
            .check(1 << 30, session.as_ref(), Network::Calibration, false, &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFundsError { .. }));
        assert_eq!(network.approvals(), 0);
    }

    #[tokio::test]
    async fn test_capped_approval_is_insufficient_allowance() {
        let network = Arc::new(
            InMemoryNetwork::new()
                .with_pricing(pricing())
                .with_wallet_balance(usdfc("50"))
                .with_approval_cap(TokenAmount(1)),
        );
        let session = session(&network).await;
        let checker = PreflightChecker::new(PreflightConfig::default());

        let err = checker
            .check(1 << 30, session.as_ref(), Network::Calibration, true, &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientAllowanceError(_)));
    }
}
