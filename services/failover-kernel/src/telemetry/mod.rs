use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, trace, Resource};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod failover;

pub struct TelemetryHandle {
    registry: Arc<Registry>,
    meter_provider: MeterProvider,
}

impl TelemetryHandle {
    pub async fn serve_metrics(&self, addr: SocketAddr) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener at {addr}"))?;
        let app = metrics_router(self.registry.clone());

        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app.into_make_service()).await {
                warn!(?error, "metrics server terminated");
            }
        });

        Ok(handle)
    }

    pub fn shutdown(self) {
        if let Err(error) = self.meter_provider.force_flush() {
            warn!(?error, "failed to flush meter provider before shutdown");
        }
        if let Err(error) = self.meter_provider.shutdown() {
            warn!(?error, "failed to shutdown meter provider");
        }
        opentelemetry::global::shutdown_meter_provider();
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Installs the tracing subscriber and the Prometheus-backed meter provider.
/// Spans are exported over OTLP only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init() -> anyhow::Result<TelemetryHandle> {
    let service_name = std::env::var("REPMAN_OTEL_SERVICE_NAME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| std::env::var("OTEL_SERVICE_NAME").ok())
        .unwrap_or_else(|| "replication-manager".to_string());
    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let registry = Arc::new(registry);

    let meter_provider = MeterProvider::builder()
        .with_resource(resource.clone())
        .with_reader(exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let otlp_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        Some(endpoint) => {
            let trace_config = trace::Config::default().with_resource(resource);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace_config)
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otlp_layer)
        .try_init()
        .ok();

    Ok(TelemetryHandle {
        registry,
        meter_provider,
    })
}

fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new().route("/metrics", get(move || metrics_handler(registry.clone())))
}

async fn metrics_handler(registry: Arc<Registry>) -> Response {
    let metric_families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
        warn!(?error, "failed to render prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics").into_response();
    }
    match String::from_utf8(buffer) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(error) => {
            warn!(?error, "failed to encode prometheus metrics as utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}
