// Telemetry module for structured logging, metrics, and tracing

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
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "jobs-service";

/// Initialize structured logging with JSON formatting and trace context
///
/// `RUST_LOG` wins over `log_level` when set. When `tracing_endpoint` is
/// given, spans are also exported over OTLP.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let otel_layer = tracing_endpoint
        .map(init_tracer)
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
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

/// Shutdown OpenTelemetry tracer provider, flushing remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the job metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("jobs_scheduled_total", "Jobs accepted by schedule()");
    describe_counter!("jobs_executed_total", "Successful job executions");
    describe_counter!(
        "job_execution_errors_total",
        "Failed job executions, retried or not"
    );
    describe_counter!("jobs_canceled_total", "Jobs canceled before completion");
    describe_counter!(
        "reconcile_armed_total",
        "Jobs armed by reconciliation passes"
    );
    describe_histogram!(
        "job_execution_duration_seconds",
        "Time from dispatch to executor response, by recipient kind"
    );
    describe_gauge!("armed_timers", "Timers currently armed in this process");
    describe_gauge!(
        "lease_owner",
        "1 while this instance owns the reconciliation lease"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_scheduled() {
    counter!("jobs_scheduled_total").increment(1);
}

#[inline]
pub fn record_job_executed() {
    counter!("jobs_executed_total").increment(1);
}

#[inline]
pub fn record_job_execution_error() {
    counter!("job_execution_errors_total").increment(1);
}

#[inline]
pub fn record_job_canceled() {
    counter!("jobs_canceled_total").increment(1);
}

/// Record how long one execution took and how it ended
#[inline]
pub fn record_execution_duration(recipient: &'static str, success: bool, elapsed: Duration) {
    histogram!(
        "job_execution_duration_seconds",
        "recipient" => recipient,
        "outcome" => if success { "success" } else { "error" }
    )
    .record(elapsed.as_secs_f64());
}

#[inline]
pub fn record_reconcile_armed(armed: usize) {
    counter!("reconcile_armed_total").increment(armed as u64);
}

#[inline]
pub fn set_armed_timers(armed: usize) {
    gauge!("armed_timers").set(armed as f64);
}

#[inline]
pub fn set_lease_owner(owner: bool) {
    gauge!("lease_owner").set(if owner { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_logging_init_is_an_error() {
        // the first call may already lose to another test in this process
        let _ = init_logging("info", None);
        let err = init_logging("info", None).unwrap_err();
        assert!(err.to_string().contains("Failed to"));
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_job_scheduled();
        record_job_executed();
        record_job_execution_error();
        record_job_canceled();
        record_execution_duration("http", true, Duration::from_millis(20));
        record_reconcile_armed(3);
        set_armed_timers(2);
        set_lease_owner(true);
    }
}
