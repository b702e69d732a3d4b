//! Observability: distributed tracing, metrics, and logging.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
///
/// Installs the tracing subscriber (JSON or plain fmt, optional OTLP export)
/// and the Prometheus metrics recorder. Returns the handle that the
/// `/metrics` endpoint renders.
pub fn init(service_name: &str, cfg: &ObservabilityConfig) -> anyhow::Result<PrometheusHandle> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    if let Some(endpoint) = cfg.otlp_endpoint.as_deref() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config().with_resource(
                    opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                        "service.name",
                        service_name.to_string(),
                    )]),
                ),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        if cfg.json_logging {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    } else if cfg.json_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    Ok(prometheus)
}

/// Shutdown OpenTelemetry, flushing any pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
