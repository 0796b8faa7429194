//! Prometheus metrics and HTTP probes for the switching center.

use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct Probe {
    status: &'static str,
    version: &'static str,
    accepting: bool,
}

/// Whether the accept loop is taking new relay connections.
///
/// Starts out not accepting; `main` flips it once the listener is bound and
/// back again when draining on shutdown.
#[derive(Clone, Default)]
pub struct HealthState {
    accepting: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that reports not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether new relays are being accepted.
    pub fn set_ready(&self, ready: bool) {
        self.accepting.store(ready, Ordering::Relaxed);
    }

    /// Check whether new relays are being accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    fn probe(&self, status: &'static str) -> Json<Probe> {
        Json(Probe {
            status,
            version: env!("CARGO_PKG_VERSION"),
            accepting: self.is_ready(),
        })
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let health = health_state.clone();

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(move || health_handler(health.clone())))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(state: HealthState) -> (StatusCode, Json<Probe>) {
    (StatusCode::OK, state.probe("ok"))
}

async fn ready_handler(state: HealthState) -> (StatusCode, Json<Probe>) {
    if state.is_ready() {
        (StatusCode::OK, state.probe("ready"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, state.probe("draining"))
    }
}

/// Relay connection gauges.
pub mod gauges {
    /// Increment the registered relays gauge.
    pub fn inc_relays_active() {
        metrics::gauge!("samcom_relays_active").increment(1.0);
    }

    /// Decrement the registered relays gauge.
    pub fn dec_relays_active() {
        metrics::gauge!("samcom_relays_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Count an inbound packet by wire type.
    pub fn packets_total(kind: &'static str) {
        metrics::counter!("samcom_packets_total", "type" => kind).increment(1);
    }

    /// Record an authentication outcome.
    pub fn auth_results_total(status: &'static str) {
        metrics::counter!("samcom_auth_results_total", "status" => status).increment(1);
    }

    /// Increment the routed-texts counter.
    pub fn texts_routed_total() {
        metrics::counter!("samcom_texts_routed_total").increment(1);
    }

    /// Count a text that could not be routed, by reason.
    pub fn routing_failures_total(reason: &'static str) {
        metrics::counter!("samcom_routing_failures_total", "reason" => reason).increment(1);
    }

    /// Count a packet that failed to decode or was rejected at the link level.
    pub fn protocol_errors_total() {
        metrics::counter!("samcom_protocol_errors_total").increment(1);
    }

    /// Count users released because their relay went away.
    pub fn users_released_total(count: u64) {
        metrics::counter!("samcom_users_released_total").increment(count);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long the engine took to handle one packet, in seconds.
    pub fn packet_handling_seconds(value: f64) {
        metrics::histogram!("samcom_packet_handling_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_starts_not_ready() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.clone().is_ready());
    }

    #[tokio::test]
    async fn ready_probe_reflects_accepting_flag() {
        let state = HealthState::new();
        let (code, body) = ready_handler(state.clone()).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.accepting);

        state.set_ready(true);
        let (code, body) = ready_handler(state).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "ready");
    }
}
