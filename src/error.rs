//! Error types for FilTube
//!
//! Every failure raised by the upload flow, the catalog or the gateway bridge is
//! expressed as a variant of [`Error`]. `kind()` gives a stable label for metrics
//! and for the `ErrorInfo` recorded in a failed upload state.

use std::sync::Arc;

use thiserror::Error;

use crate::storage::TokenAmount;

/// Result type alias for FilTube operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage session could not be initialized: {0}")]
    SessionInitError(String),

    #[error("No proof set found for {address} on {network} (withCDN={with_cdn})")]
    NoProofSetFoundError {
        address: String,
        network: String,
        with_cdn: bool,
    },

    #[error("Insufficient USDFC balance: {required} required, {available} available")]
    InsufficientFundsError {
        required: TokenAmount,
        available: TokenAmount,
    },

    #[error("Insufficient storage allowance: {0}")]
    InsufficientAllowanceError(String),

    #[error("File {name} is {size} bytes, which exceeds the {limit} byte limit for {kind} files")]
    FileTooLargeError {
        name: String,
        kind: String,
        size: u64,
        limit: u64,
    },

    #[error("Precondition failed: {0}")]
    PreconditionError(String),

    #[error("Upload failed: {0}")]
    UploadTransportError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The same failure delivered to every caller awaiting one in-flight operation
    #[error(transparent)]
    SharedError(Arc<Error>),

    #[error(transparent)]
    UnknownError(#[from] anyhow::Error),
}

impl Error {
    /// Stable snake_case label for the error category
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SessionInitError(_) => "session_init",
            Error::NoProofSetFoundError { .. } => "no_proof_set_found",
            Error::InsufficientFundsError { .. } => "insufficient_funds",
            Error::InsufficientAllowanceError(_) => "insufficient_allowance",
            Error::FileTooLargeError { .. } => "file_too_large",
            Error::PreconditionError(_) => "precondition",
            Error::UploadTransportError(_) => "upload_transport",
            Error::ValidationError(_) => "validation",
            Error::NotFoundError(_) => "not_found",
            Error::ConfigError(_) => "config",
            Error::DatabaseError(_) => "database",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::IoError(_) => "io",
            Error::SharedError(inner) => inner.kind(),
            Error::UnknownError(_) => "unknown",
        }
    }

    /// True when the error was caused by caller input rather than by a collaborator
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::ValidationError(_) | Error::NotFoundError(_) | Error::FileTooLargeError { .. } => {
                true
            }
            Error::SharedError(inner) => inner.is_client_error(),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                errs.iter()
                    .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
                    .unwrap_or_else(|| format!("{field} is invalid"))
            })
            .collect();
        fields.sort();
        Error::ValidationError(fields.join(", "))
    }
}
