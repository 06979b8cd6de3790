//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Request lifecycle transitions
//! - Claim races and rejections
//! - Verification polling outcomes
//! - Collateral releases and refunds

use crate::error::{EscrowError, EscrowResult};
use crate::events::EscrowEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Lifecycle metrics
    pub static ref REQUESTS_LOCKED: CounterVec = register_counter_vec!(
        "zeromiles_requests_locked_total",
        "Total loan requests created with collateral in custody",
        &["denom"]
    ).unwrap();

    pub static ref CLAIMS_ACCEPTED: CounterVec = register_counter_vec!(
        "zeromiles_claims_accepted_total",
        "Total solver claims that won the request",
        &[]
    ).unwrap();

    pub static ref CLAIMS_REJECTED: CounterVec = register_counter_vec!(
        "zeromiles_claims_rejected_total",
        "Total solver claims rejected by reason",
        &["reason"]
    ).unwrap();

    pub static ref REQUESTS_COMPLETED: CounterVec = register_counter_vec!(
        "zeromiles_requests_completed_total",
        "Total requests settled to a solver",
        &[]
    ).unwrap();

    pub static ref REQUESTS_FAILED: CounterVec = register_counter_vec!(
        "zeromiles_requests_failed_total",
        "Total requests whose claim failed verification",
        &["reason"]
    ).unwrap();

    // Collateral metrics
    pub static ref COLLATERAL_RELEASED: CounterVec = register_counter_vec!(
        "zeromiles_collateral_released_total",
        "Total collateral releases by destination",
        &["destination"]
    ).unwrap();

    pub static ref RELEASE_FAILURES: CounterVec = register_counter_vec!(
        "zeromiles_release_failures_total",
        "Total collateral releases the ledger refused",
        &[]
    ).unwrap();

    // Verification metrics
    pub static ref VERIFICATION_POLLS: CounterVec = register_counter_vec!(
        "zeromiles_verification_polls_total",
        "Total foreign chain verification polls by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref ACTIVE_POLLERS: Gauge = register_gauge!(
        "zeromiles_active_pollers",
        "Claims currently being polled"
    ).unwrap();

    pub static ref STALE_CLAIMS: Gauge = register_gauge!(
        "zeromiles_stale_claims",
        "Claims waiting on verification longer than the staleness threshold"
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: Histogram = register_histogram!(
        "zeromiles_settlement_latency_seconds",
        "Time from claim to verified settlement",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    pub static ref EVENTS_EMITTED: CounterVec = register_counter_vec!(
        "zeromiles_events_emitted_total",
        "Total lifecycle events by type",
        &["event_type"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "zeromiles_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "zeromiles_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EscrowResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EscrowError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EscrowError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_request_locked(denom: &str) {
    REQUESTS_LOCKED.with_label_values(&[denom]).inc();
}

pub fn record_claim_accepted() {
    CLAIMS_ACCEPTED.with_label_values(&[]).inc();
}

pub fn record_claim_rejected(reason: &str) {
    CLAIMS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_request_completed(latency_secs: f64) {
    REQUESTS_COMPLETED.with_label_values(&[]).inc();
    SETTLEMENT_LATENCY.observe(latency_secs.max(0.0));
}

pub fn record_request_failed(reason: &str) {
    REQUESTS_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_collateral_released(destination: &str) {
    COLLATERAL_RELEASED.with_label_values(&[destination]).inc();
}

pub fn record_release_failure() {
    RELEASE_FAILURES.with_label_values(&[]).inc();
}

pub fn record_poll(outcome: &str) {
    VERIFICATION_POLLS.with_label_values(&[outcome]).inc();
}

pub fn set_active_pollers(count: usize) {
    ACTIVE_POLLERS.set(count as f64);
}

pub fn record_stale_claim() {
    STALE_CLAIMS.inc();
}

pub fn clear_stale_claim() {
    STALE_CLAIMS.dec();
}

pub fn record_event(event: &EscrowEvent) {
    EVENTS_EMITTED.with_label_values(&[event.name()]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
