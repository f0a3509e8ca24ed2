// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str) -> Result<()> {
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

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, "Structured logging initialized");

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - cronjob_trigger_decisions_total: trigger evaluations by decision
/// - cronjob_missed_schedules_total: instants skipped past their deadline
/// - cronjob_dropped_instants_total: earlier instants dropped from a late window
/// - cronjob_active_runs: runs currently tracked as running
/// - authorization_decisions_total: authorization checks by outcome
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
        "cronjob_trigger_decisions_total",
        "Trigger evaluations by resulting decision"
    );
    describe_counter!(
        "cronjob_missed_schedules_total",
        "Scheduled instants not started because their deadline passed"
    );
    describe_counter!(
        "cronjob_dropped_instants_total",
        "Earlier instants dropped because the controller ran late"
    );
    describe_gauge!("cronjob_active_runs", "Runs currently tracked as running");
    describe_counter!(
        "authorization_decisions_total",
        "Authorization checks by outcome"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_trigger_decision(cronjob: &str, decision: &'static str) {
    counter!(
        "cronjob_trigger_decisions_total",
        "cronjob" => cronjob.to_string(),
        "decision" => decision
    )
    .increment(1);
}

#[inline]
pub fn record_missed_schedule(cronjob: &str) {
    counter!("cronjob_missed_schedules_total", "cronjob" => cronjob.to_string()).increment(1);
}

#[inline]
pub fn record_dropped_instants(cronjob: &str, count: usize) {
    counter!("cronjob_dropped_instants_total", "cronjob" => cronjob.to_string())
        .increment(count as u64);
}

#[inline]
pub fn update_active_runs(cronjob: &str, count: usize) {
    gauge!("cronjob_active_runs", "cronjob" => cronjob.to_string()).set(count as f64);
}

#[inline]
pub fn record_authorization(decision: &'static str) {
    counter!("authorization_decisions_total", "decision" => decision).increment(1);
}
