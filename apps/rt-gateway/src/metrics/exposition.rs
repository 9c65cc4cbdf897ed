//! Prometheus text rendering of a metrics snapshot.

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use super::collector::MetricsSnapshot;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, thiserror::Error)]
pub enum ExpositionError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

fn int_gauge(registry: &Registry, name: &str, help: &str, value: u64) -> Result<(), ExpositionError> {
    let gauge = IntGauge::new(name, help)?;
    gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
    registry.register(Box::new(gauge))?;
    Ok(())
}

fn int_counter(registry: &Registry, name: &str, help: &str, value: u64) -> Result<(), ExpositionError> {
    let counter = IntCounter::new(name, help)?;
    counter.inc_by(value);
    registry.register(Box::new(counter))?;
    Ok(())
}

fn gauge(registry: &Registry, name: &str, help: &str, value: f64) -> Result<(), ExpositionError> {
    let gauge = Gauge::new(name, help)?;
    gauge.set(value);
    registry.register(Box::new(gauge))?;
    Ok(())
}

/// Render `snapshot` into a fresh registry and encode it.
pub fn render(snapshot: &MetricsSnapshot) -> Result<String, ExpositionError> {
    let registry = Registry::new();
    let counters = &snapshot.counters;

    let active = IntGaugeVec::new(
        Opts::new("rt_gateway_active_connections", "Open connections"),
        &["namespace"],
    )?;
    let connections = IntCounterVec::new(
        Opts::new("rt_gateway_connections_total", "Connections accepted since start"),
        &["namespace"],
    )?;
    let messages = IntCounterVec::new(
        Opts::new("rt_gateway_messages_total", "Inbound messages since start"),
        &["namespace"],
    )?;
    let errors = IntCounterVec::new(
        Opts::new("rt_gateway_errors_total", "Error frames sent since start"),
        &["namespace"],
    )?;
    let auth_failures = IntCounterVec::new(
        Opts::new("rt_gateway_auth_failures_total", "Rejected connection attempts"),
        &["namespace"],
    )?;
    for (namespace, stats) in &counters.namespaces {
        let labels = [namespace.as_str()];
        active
            .with_label_values(&labels)
            .set(i64::try_from(stats.active_connections).unwrap_or(i64::MAX));
        connections.with_label_values(&labels).inc_by(stats.total_connections);
        messages.with_label_values(&labels).inc_by(stats.messages);
        errors.with_label_values(&labels).inc_by(stats.errors);
        auth_failures.with_label_values(&labels).inc_by(stats.auth_failures);
    }
    registry.register(Box::new(active))?;
    registry.register(Box::new(connections))?;
    registry.register(Box::new(messages))?;
    registry.register(Box::new(errors))?;
    registry.register(Box::new(auth_failures))?;

    let limits = IntCounterVec::new(
        Opts::new("rt_gateway_rate_limit_hits_total", "Requests rejected by the limiter"),
        &["kind"],
    )?;
    limits
        .with_label_values(&["window"])
        .inc_by(counters.rate_limit_hits.saturating_sub(counters.burst_limit_hits));
    limits.with_label_values(&["burst"]).inc_by(counters.burst_limit_hits);
    registry.register(Box::new(limits))?;

    let deliveries = IntCounterVec::new(
        Opts::new("rt_gateway_deliveries_total", "Outbound fan-out attempts"),
        &["outcome"],
    )?;
    deliveries
        .with_label_values(&["delivered"])
        .inc_by(counters.messages_delivered);
    deliveries
        .with_label_values(&["failed"])
        .inc_by(counters.delivery_failures);
    registry.register(Box::new(deliveries))?;

    int_counter(
        &registry,
        "rt_gateway_suspicious_activities_total",
        "Oversized, malformed-streak or burst events",
        counters.suspicious_activities,
    )?;
    int_gauge(
        &registry,
        "rt_gateway_subscriptions",
        "Live (connection, resource) subscriptions",
        snapshot.subscriptions as u64,
    )?;
    int_gauge(
        &registry,
        "rt_gateway_rate_limit_entries",
        "Tracked rate-limit keys",
        snapshot.rate_limiter.total_entries as u64,
    )?;
    int_gauge(
        &registry,
        "rt_gateway_memory_bytes",
        "Resident memory of the gateway process",
        snapshot.resources.memory_bytes,
    )?;
    int_gauge(
        &registry,
        "rt_gateway_uptime_seconds",
        "Seconds since start",
        snapshot.resources.uptime_secs,
    )?;
    gauge(
        &registry,
        "rt_gateway_health_score",
        "Composite health score, 0-100",
        snapshot.health_score,
    )?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| ExpositionError::Encoding(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| ExpositionError::Encoding(e.to_string()))
}
