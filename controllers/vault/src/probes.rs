//! Liveness, readiness and Prometheus metrics endpoints.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reconciliation metrics, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        Self::register().map_err(|e| ControllerError::Metrics(e.to_string()))
    }

    fn register() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "vault_operator_reconciliations_total",
                "Reconciliation passes by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "vault_operator_reconcile_duration_seconds",
                "Wall time of a reconciliation pass, conflict restarts included",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["result"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            duration,
        })
    }

    /// Records one pass. `result` is "success" or an error reason.
    pub fn observe_reconcile(&self, result: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    pub fn reconciliations(&self, result: &str) -> u64 {
        self.reconciliations.with_label_values(&[result]).get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ControllerError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(e.to_string()))
    }
}

/// Shared by the probe handlers.
#[derive(Clone)]
pub struct ProbeState {
    pub metrics: Arc<Metrics>,
    /// Set once the VaultService watcher is running
    pub ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> StatusCode {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the probe endpoints until the listener fails.
pub async fn serve(addr: SocketAddr, state: ProbeState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("bind probes on {}: {}", addr, e)))?;
    info!("Serving /healthz, /readyz and /metrics on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Watch(format!("probe server failed: {}", e)))
}
