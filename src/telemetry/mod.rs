//! Tracing and metrics setup for the dialdesk processes.
//!
//! Every process logs through a `tracing` fmt layer. With `OTEL_ENDPOINT`
//! set, spans and the `dialdesk.*` instruments are also exported over OTLP,
//! tagged with the process role (`workers` or `scheduler`).

pub mod metrics;
pub mod spans;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Resource attribute naming which dialdesk process emitted a signal.
pub const ROLE_ATTRIBUTE: &str = "dialdesk.role";

/// Crates whose debug output drowns the engine's own events.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "h2=warn", "tonic=warn", "hyper=warn"];

/// OTLP providers, flushed and shut down when dropped.
///
/// Hold it for the life of the process; without an endpoint it is empty.
pub struct TelemetryGuard {
    otlp: Option<OtlpProviders>,
}

struct OtlpProviders {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.otlp.is_some()
    }

    pub fn force_flush(&self) {
        if let Some(otlp) = &self.otlp {
            let _ = otlp.tracer.force_flush();
            let _ = otlp.meter.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(otlp) = self.otlp.take() {
            let _ = otlp.meter.shutdown();
            let _ = otlp.tracer.shutdown();
        }
    }
}

/// Filter from `RUST_LOG`, else `log_level` with noisy dependencies
/// held at warn.
pub fn log_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = std::iter::once(log_level)
            .chain(QUIET_TARGETS.iter().copied())
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::new(directives)
    })
}

fn otlp_providers(endpoint: &str, role: &str) -> Result<OtlpProviders> {
    let resource = Resource::builder()
        .with_service_name("dialdesk")
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .with_attribute(KeyValue::new(ROLE_ATTRIBUTE, role.to_string()))
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP span exporter for {endpoint}: {e}")))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let instruments = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP metric exporter for {endpoint}: {e}")))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(instruments)
        .with_resource(resource)
        .build();
    // metrics.rs resolves its instruments through the global provider.
    opentelemetry::global::set_meter_provider(meter.clone());

    Ok(OtlpProviders { tracer, meter })
}

/// Install the subscriber for one dialdesk process.
///
/// Fails if an exporter cannot be built or a subscriber is already set.
pub fn init_telemetry(config: &Config, role: &str) -> Result<TelemetryGuard> {
    let filter = log_filter(&config.log_level);
    let subscriber_err = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to init tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.otel_endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_err)?;
        return Ok(TelemetryGuard { otlp: None });
    };

    let otlp = otlp_providers(endpoint, role)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(otlp.tracer.tracer("dialdesk")))
        .try_init()
        .map_err(subscriber_err)?;

    tracing::info!(endpoint, role, "exporting telemetry over OTLP");
    Ok(TelemetryGuard { otlp: Some(otlp) })
}
