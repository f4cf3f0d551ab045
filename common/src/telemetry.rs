// Telemetry module for structured logging, metrics, and tracing

use crate::config::LogFormat;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const SERVICE_NAME: &str = "report-scheduler";

/// Initialize structured logging
///
/// Sets up the tracing subscriber with:
/// - JSON (default) or human-readable formatting
/// - Log levels from `RUST_LOG`, falling back to the configured level
/// - Optional OpenTelemetry export when an OTLP endpoint is configured
#[tracing::instrument(skip_all)]
pub fn init_logging(
    log_level: &str,
    format: LogFormat,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = tracing_endpoint.filter(|e| !e.is_empty()) {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        log_format = ?format,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans; call on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - task_success_total: successful executions
/// - task_failed_total: failed executions
/// - task_duration_seconds: execution duration
/// - task_skipped_fires_total: fires dropped because the task was still running
/// - scheduler_registered_tasks: tasks currently waiting for a fire
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "task_success_total",
        "Total number of successful task executions"
    );
    describe_counter!("task_failed_total", "Total number of failed task executions");
    describe_histogram!(
        "task_duration_seconds",
        "Duration of task executions in seconds"
    );
    describe_counter!(
        "task_skipped_fires_total",
        "Fires skipped because the task was already running"
    );
    describe_gauge!(
        "scheduler_registered_tasks",
        "Number of tasks waiting for their next fire"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_task_success(task_id: &str, task_name: &str) {
    counter!("task_success_total", "task_id" => task_id.to_string(), "task_name" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_task_failure(task_id: &str, task_name: &str) {
    counter!(
        "task_failed_total",
        "task_id" => task_id.to_string(),
        "task_name" => task_name.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_task_duration(task_id: &str, task_name: &str, duration_seconds: f64) {
    histogram!(
        "task_duration_seconds",
        "task_id" => task_id.to_string(),
        "task_name" => task_name.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_skipped_fire(task_id: &str) {
    counter!("task_skipped_fires_total", "task_id" => task_id.to_string()).increment(1);
}

#[inline]
pub fn update_registered_tasks(count: usize) {
    gauge!("scheduler_registered_tasks").set(count as f64);
}
