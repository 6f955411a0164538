//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server lifecycle metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `identity_server_state_transitions_total` (counter): by from, to
//! - `identity_server_shutdown_phase_seconds` (histogram): by phase
//! - `identity_server_shutdowns_total` (counter): by trigger, outcome
//! - `identity_server_shutdown_seconds` (histogram): whole sequence
//! - `identity_server_shutdown_errors_total` (counter): by cause
//! - `identity_server_startup_failures_total` (counter): by reason
//! - `identity_server_identity_rotations_total` (counter): by outcome, reason
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are static strings only

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with an HTTP scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_transition(from: &'static str, to: &'static str) {
    ::metrics::counter!("identity_server_state_transitions_total", "from" => from, "to" => to).increment(1);
}

pub fn record_phase(phase: &'static str, elapsed: Duration) {
    ::metrics::histogram!("identity_server_shutdown_phase_seconds", "phase" => phase).record(elapsed.as_secs_f64());
}

pub fn record_shutdown(trigger: &'static str, elapsed: Duration, errors: usize) {
    let outcome = if errors == 0 { "clean" } else { "errors" };
    ::metrics::counter!("identity_server_shutdowns_total", "trigger" => trigger, "outcome" => outcome).increment(1);
    ::metrics::histogram!("identity_server_shutdown_seconds").record(elapsed.as_secs_f64());
}

pub fn record_shutdown_error(cause: &'static str) {
    ::metrics::counter!("identity_server_shutdown_errors_total", "cause" => cause).increment(1);
}

pub fn record_startup_failure(reason: &'static str) {
    ::metrics::counter!("identity_server_startup_failures_total", "reason" => reason).increment(1);
}

/// `failure` carries the error label of a failed rotation.
pub fn record_rotation(failure: Option<&'static str>) {
    let (outcome, reason) = match failure {
        None => ("success", "none"),
        Some(reason) => ("failure", reason),
    };
    ::metrics::counter!("identity_server_identity_rotations_total", "outcome" => outcome, "reason" => reason)
        .increment(1);
}
