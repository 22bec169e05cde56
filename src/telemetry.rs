//! Logging and OpenTelemetry initialization
//!
//! `init_tracing` installs the stdout subscriber (plain or JSON) and, when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OTLP span exporter whose spans have
//! wallet addresses shortened before export.

use opentelemetry::trace::TraceResult;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config, Sampler, SpanProcessor};
use std::env;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

use crate::error::{Error, Result};
use crate::storage::truncate_address;

const SERVICE_NAME: &str = "filtube";

/// Span attributes that carry a wallet address
const ADDRESS_KEYS: &[&str] = &["wallet", "address", "recipient", "signer", "author_address"];

/// Span attributes dropped entirely
const REDACTED_KEYS: &[&str] = &["http.client_ip", "net.peer.ip", "host.name"];

/// A span processor that shortens wallet addresses and redacts client addresses
#[derive(Debug)]
struct ScrubbingProcessor {
    inner: std::sync::Mutex<Box<dyn SpanProcessor + Send + Sync>>,
}

impl ScrubbingProcessor {
    fn new(inner: Box<dyn SpanProcessor + Send + Sync>) -> Self {
        ScrubbingProcessor {
            inner: std::sync::Mutex::new(inner),
        }
    }

    fn scrub_attributes(&self, attributes: &mut [KeyValue]) {
        for kv in attributes.iter_mut() {
            let key = kv.key.as_str();
            if REDACTED_KEYS.contains(&key) {
                kv.value = opentelemetry::Value::String("[REDACTED]".into());
            } else if ADDRESS_KEYS.contains(&key) {
                let short = truncate_address(&kv.value.as_str());
                kv.value = opentelemetry::Value::String(short.into());
            }
        }
    }
}

impl SpanProcessor for ScrubbingProcessor {
    fn on_start(&self, span: &mut opentelemetry_sdk::trace::Span, cx: &opentelemetry::Context) {
        if let Ok(inner) = self.inner.lock() {
            inner.on_start(span, cx);
        }
    }

    fn on_end(&self, mut span: SpanData) {
        self.scrub_attributes(&mut span.attributes);
        if let Ok(inner) = self.inner.lock() {
            inner.on_end(span);
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        match self.inner.lock() {
            Ok(inner) => inner.force_flush(),
            Err(_) => Ok(()),
        }
    }

    fn shutdown(&mut self) -> TraceResult<()> {
        match self.inner.lock() {
            Ok(mut inner) => inner.shutdown(),
            Err(_) => Ok(()),
        }
    }
}

/// Install the global subscriber. Call once, at startup.
pub fn init_tracing(json: bool) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with((!json).then(|| fmt::layer().with_target(true)))
        .with(json.then(|| fmt::layer().json().with_current_span(true)));

    let init = if env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = init_telemetry(&registry)?;
        let result = registry.with(otel_layer).try_init();
        info!("OpenTelemetry tracing initialized");
        result
    } else {
        registry.try_init()
    };
    init.map_err(|e| Error::ConfigError(format!("tracing already initialized: {e}")))
}

/// Build the OTLP tracing layer and register the global tracer provider
pub fn init_telemetry<S>(_subscriber: &S) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&otlp_endpoint)
        .build_span_exporter()
        .map_err(|e| Error::ConfigError(format!("OTLP exporter for {otlp_endpoint}: {e}")))?;

    let batch_processor =
        opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter, runtime::Tokio).build();

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_config(
            Config::default()
                .with_resource(resource)
                .with_sampler(Sampler::AlwaysOn),
        )
        .with_span_processor(ScrubbingProcessor::new(Box::new(batch_processor)))
        .build();

    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

/// Flush and shut down the tracer provider
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
