//! Log and trace output for the queue service.
//!
//! Console output, text or one JSON object per line, is always installed.
//! Spans are also exported over OTLP when `otel.enabled` is set; the
//! returned guard flushes them on drop.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{Sampler, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LoggingConfig, OtelConfig};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },
    #[error("Failed to build OTLP span exporter: {0}")]
    Exporter(String),
    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Owns the span exporter, if any. Drop it last.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans leave the process
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            tracing::info!("Flushing exported spans");
            if let Err(e) = provider.shutdown() {
                eprintln!("OpenTelemetry shutdown failed: {e}");
            }
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_telemetry(
    logging: &LoggingConfig,
    otel: &OtelConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), &logging.level)?;

    let provider = if otel.enabled {
        Some(span_exporter(otel)?)
    } else {
        None
    };
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(otel.service_name.clone()))
    });

    let (text, json) = if logging.json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    tracing::info!(
        json_logs = logging.json,
        otel_enabled = otel.enabled,
        otel_endpoint = %otel.endpoint,
        sampling_ratio = otel.sampling_ratio,
        "Telemetry initialized"
    );

    Ok(TelemetryGuard { provider })
}

fn log_filter(from_env: Option<String>, fallback: &str) -> Result<EnvFilter, TelemetryError> {
    let directives = from_env.unwrap_or_else(|| fallback.to_string());
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter {
        filter: directives.clone(),
        reason: e.to_string(),
    })
}

fn sampler_for(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn span_exporter(otel: &OtelConfig) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otel.endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, otel.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler_for(otel.sampling_ratio))
        .with_resource(resource)
        .build())
}

/// Attributes put on the per-connection span
pub mod attributes {
    use opentelemetry::KeyValue;

    pub fn connection_id(id: &str) -> KeyValue {
        KeyValue::new("connection.id", id.to_string())
    }

    pub fn owner(owner: &str) -> KeyValue {
        KeyValue::new("connection.owner", owner.to_string())
    }
}
