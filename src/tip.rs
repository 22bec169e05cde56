//! Tipping a channel owner in USDFC
//!
//! A tip is a plain token transfer from the connected wallet to the channel's
//! wallet. Only the calibration network is supported.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::storage::{truncate_address, Network, TokenAmount, TransactionInfo};

/// Amounts offered by the tip slider, in whole USDFC
pub const PREDEFINED_AMOUNTS: [u64; 8] = [5, 10, 25, 50, 100, 200, 500, 1000];

/// Submits USDFC transfers on behalf of the connected wallet
#[async_trait]
pub trait TokenTransfer: Send + Sync {
    async fn transfer(&self, recipient: &str, amount: TokenAmount) -> Result<TransactionInfo>;
}

/// A validated tip, ready to be submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TipRequest {
    pub recipient: String,
    pub amount: TokenAmount,
}

fn is_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Validate a tip before anything is signed.
///
/// `amount` is a decimal USDFC string such as `"25"` or `"0.5"`.
pub fn prepare_tip(connected: bool, chain_id: u64, recipient: &str, amount: &str) -> Result<TipRequest> {
    if !connected {
        return Err(Error::PreconditionError(
            "Please connect your wallet first.".to_string(),
        ));
    }
    if chain_id != Network::Calibration.chain_id() {
        return Err(Error::PreconditionError(
            "Please switch to the Calibration testnet to send a tip.".to_string(),
        ));
    }
    let recipient = recipient.trim();
    if !is_address(recipient) {
        return Err(Error::ValidationError(format!(
            "'{recipient}' is not a wallet address"
        )));
    }
    let amount = TokenAmount::parse_units(amount)
        .map_err(|_| Error::ValidationError("Please enter a valid tip amount.".to_string()))?;
    if amount == TokenAmount::ZERO {
        return Err(Error::ValidationError(
            "Please enter a valid tip amount.".to_string(),
        ));
    }

    Ok(TipRequest {
        recipient: recipient.to_string(),
        amount,
    })
}

#[instrument(skip(transfer, request), fields(recipient = %truncate_address(&request.recipient)))]
pub async fn send_tip(transfer: &dyn TokenTransfer, request: &TipRequest) -> Result<TransactionInfo> {
    let tx = transfer.transfer(&request.recipient, request.amount).await?;
    info!("Tip of {} sent in {}", request.amount, tx.hash);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const CHANNEL: &str = "0x00000000000000000000000000000000000000aa";

    #[derive(Default)]
    struct RecordingTransfer {
        sent: Mutex<Vec<(String, TokenAmount)>>,
    }

    #[async_trait]
    impl TokenTransfer for RecordingTransfer {
        async fn transfer(&self, recipient: &str, amount: TokenAmount) -> Result<TransactionInfo> {
            self.sent.lock().unwrap().push((recipient.to_string(), amount));
            Ok(TransactionInfo {
                hash: "0xfeed".to_string(),
            })
        }
    }

    #[test]
    fn test_prepare_converts_to_base_units() {
        let tip = prepare_tip(true, 314159, CHANNEL, "25").unwrap();
        assert_eq!(tip.amount, TokenAmount(25 * 10u128.pow(18)));

        let tip = prepare_tip(true, 314159, CHANNEL, "0.5").unwrap();
        assert_eq!(tip.amount, TokenAmount(5 * 10u128.pow(17)));
    }

    #[test]
    fn test_prepare_rejects_bad_input() {
        let err = prepare_tip(false, 314159, CHANNEL, "5").unwrap_err();
        assert!(matches!(err, Error::PreconditionError(_)));

        let err = prepare_tip(true, 314, CHANNEL, "5").unwrap_err();
        assert!(err.to_string().contains("Calibration"));

        for amount in ["0", "", "abc", "-1"] {
            let err = prepare_tip(true, 314159, CHANNEL, amount).unwrap_err();
            assert!(matches!(err, Error::ValidationError(_)), "{amount}");
        }

        assert!(prepare_tip(true, 314159, "alice", "5").is_err());
    }

    #[test]
    fn test_predefined_amounts_are_valid() {
        for amount in PREDEFINED_AMOUNTS {
            assert!(prepare_tip(true, 314159, CHANNEL, &amount.to_string()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_send_tip() {
        let transfer = RecordingTransfer::default();
        let tip = prepare_tip(true, 314159, CHANNEL, "10").unwrap();

        let tx = send_tip(&transfer, &tip).await.unwrap();
        assert_eq!(tx.hash, "0xfeed");
        assert_eq!(
            transfer.sent.lock().unwrap().as_slice(),
            &[(CHANNEL.to_string(), TokenAmount(10 * 10u128.pow(18)))]
        );
    }
}
