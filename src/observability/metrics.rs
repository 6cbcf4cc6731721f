//! Metrics collection and exposition.
//!
//! # Metrics
//! - `connector_channel_state` (gauge): current ConnectionState as a number, per channel
//! - `connector_probes_total` (counter): probes by channel and outcome
//! - `connector_probe_duration_seconds` (histogram): probe latency
//! - `connector_inflight_messages` (gauge): unacknowledged outgoing sends
//! - `connector_send_timeouts_total` (counter): sends rejected after max block
//! - `connector_send_failures_total` (counter): admitted sends that failed per message
//! - `connector_backpressure_failures_total` (counter): terminal overflows
//! - `connector_recoveries_total` (counter): recovery triggers by outcome
//! - `connector_ready` / `connector_alive` (gauge): 1=true, 0=false
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::health::state::ConnectionState;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_channel_state(channel: &str, state: ConnectionState) {
    gauge!("connector_channel_state", "channel" => channel.to_string()).set(state as u8 as f64);
}

pub fn record_probe(channel: &str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "connector_probes_total",
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("connector_probe_duration_seconds", "channel" => channel.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_inflight(channel: &str, count: usize) {
    gauge!("connector_inflight_messages", "channel" => channel.to_string()).set(count as f64);
}

pub fn record_send_timeout(channel: &str) {
    counter!("connector_send_timeouts_total", "channel" => channel.to_string()).increment(1);
}

pub fn record_send_failure(channel: &str) {
    counter!("connector_send_failures_total", "channel" => channel.to_string()).increment(1);
}

pub fn record_backpressure_failure(channel: &str) {
    counter!("connector_backpressure_failures_total", "channel" => channel.to_string())
        .increment(1);
}

pub fn record_recovery(channel: &str, outcome: &'static str) {
    counter!(
        "connector_recoveries_total",
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_health(ready: bool, alive: bool) {
    gauge!("connector_ready").set(if ready { 1.0 } else { 0.0 });
    gauge!("connector_alive").set(if alive { 1.0 } else { 0.0 });
}
