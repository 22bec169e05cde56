//! Prometheus metrics for FilTube
//!
//! # Exported metrics
//! The `/metrics` endpoint exports:
//! - `filtube_uploads_total` (counter): finished uploads labeled by outcome and file kind.
//! - `filtube_upload_bytes_total` (counter): bytes of successfully stored files.
//! - `filtube_upload_duration_seconds` (histogram): upload duration labeled by file kind.
//! - `filtube_catalog_requests_total` (counter): catalog calls labeled by procedure and outcome.

use std::sync::atomic::AtomicU64;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};
use crate::upload::FileKind;

/// Labels for finished uploads
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UploadLabels {
    /// "succeeded" or the error kind, e.g. "insufficient_funds"
    pub outcome: String,
    /// "video" or "image"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

/// Labels for catalog RPC calls
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CatalogLabels {
    /// Procedure name, e.g. "video.getAll"
    pub procedure: String,
    /// "ok" or the error kind
    pub outcome: String,
}

pub static UPLOADS_TOTAL: Lazy<Family<UploadLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static UPLOAD_BYTES_TOTAL: Lazy<Family<KindLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking upload duration (seconds)
pub static UPLOAD_DURATION_SECONDS: Lazy<Family<KindLabels, Histogram>> = Lazy::new(|| {
    fn upload_histogram() -> Histogram {
        // 100ms .. ~55min across 16 buckets
        Histogram::new(exponential_buckets(0.1, 2.0, 16))
    }

    Family::new_with_constructor(upload_histogram)
});

pub static CATALOG_REQUESTS_TOTAL: Lazy<Family<CatalogLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "filtube_uploads",
        "Total number of finished uploads",
        UPLOADS_TOTAL.clone(),
    );
    registry.register(
        "filtube_upload_bytes",
        "Total bytes stored on Filecoin",
        UPLOAD_BYTES_TOTAL.clone(),
    );
    registry.register(
        "filtube_upload_duration_seconds",
        "Duration of uploads in seconds",
        UPLOAD_DURATION_SECONDS.clone(),
    );
    registry.register(
        "filtube_catalog_requests",
        "Total number of catalog procedure calls",
        CATALOG_REQUESTS_TOTAL.clone(),
    );
    registry
});

/// Record one finished upload attempt.
pub fn record_upload(kind: FileKind, outcome: &str, bytes: u64, elapsed: Duration) {
    let kind = kind.as_str().to_string();
    UPLOADS_TOTAL
        .get_or_create(&UploadLabels {
            outcome: outcome.to_string(),
            kind: kind.clone(),
        })
        .inc();

    let labels = KindLabels { kind };
    if outcome == "succeeded" {
        UPLOAD_BYTES_TOTAL.get_or_create(&labels).inc_by(bytes);
    }
    UPLOAD_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(elapsed.as_secs_f64());
}

/// Increment the catalog request counter.
pub fn record_catalog(procedure: &str, outcome: &str) {
    CATALOG_REQUESTS_TOTAL
        .get_or_create(&CatalogLabels {
            procedure: procedure.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

/// Render every registered metric in the OpenMetrics text format
pub fn encode_metrics() -> Result<String> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)
        .map_err(|e| Error::UnknownError(anyhow::anyhow!("metrics encoding failed: {e}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upload() {
        record_upload(FileKind::Image, "succeeded", 2048, Duration::from_millis(300));
        let labels = KindLabels {
            kind: "image".to_string(),
        };
        assert!(UPLOAD_BYTES_TOTAL.get_or_create(&labels).get() >= 2048);
    }

    #[test]
    fn test_failed_uploads_are_labeled_by_error_kind() {
        record_upload(FileKind::Video, "upload_transport", 4096, Duration::from_secs(1));
        let failed = UPLOADS_TOTAL
            .get_or_create(&UploadLabels {
                outcome: "upload_transport".to_string(),
                kind: "video".to_string(),
            })
            .get();
        assert!(failed >= 1);
    }

    #[test]
    fn test_encode_includes_families() {
        record_catalog("video.getAll", "ok");
        let text = encode_metrics().unwrap();
        assert!(text.contains("filtube_catalog_requests_total"));
        assert!(text.contains("procedure=\"video.getAll\""));
        assert!(text.contains("filtube_upload_duration_seconds"));
    }
}
