//! Internal logging and tracing configurations

use std::env;

use opentelemetry::trace::TraceContextExt as _;
use opentelemetry::{KeyValue, TraceId, trace::TracerProvider};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_resource_detectors::{K8sResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    Resource,
    trace::{SdkTracer, SdkTracerProvider},
};
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt as _};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn otel_resource() -> Resource {
    Resource::builder()
        .with_detector(Box::new(K8sResourceDetector))
        .with_detector(Box::new(ProcessResourceDetector))
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

fn build_tracer() -> anyhow::Result<SdkTracer> {
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(otel_resource())
        .with_batch_exporter(exporter)
        .build();

    Ok(provider.tracer("tracing-otel-subscriber"))
}

fn is_otel_enabled() -> bool {
    env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

/// Initializes the tracing subscriber stack.
///
/// `LOG_FORMAT=json` switches to structured output and `LOG_LEVEL` feeds the
/// env filter; spans are exported over OTLP when an endpoint is configured.
///
/// # Errors
/// Will return `Err` if the subscriber cannot be installed
pub fn init() -> anyhow::Result<()> {
    let logger = env::var("LOG_FORMAT").map_or(tracing_subscriber::fmt::layer().boxed(), |v| {
        if v == "json" {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        }
    });

    let registry = Registry::default()
        .with(EnvFilter::from_env("LOG_LEVEL"))
        .with(logger);

    if is_otel_enabled() {
        registry.with(OpenTelemetryLayer::new(build_tracer()?)).try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}
