//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the webhook is registered)
//! - `/metrics` - Prometheus metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// How an admission request ended
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    /// A patch was returned
    Patched,
    /// The rule matched but had nothing to add, or its iteration limit was hit
    Skipped,
    /// Mutation failed; the pod was admitted unchanged
    Error,
    /// Not a pod, or no rule for the fingerprint
    Ignored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Patched => "patched",
            Outcome::Skipped => "skipped",
            Outcome::Error => "error",
            Outcome::Ignored => "ignored",
        }
    }
}

/// Labels for admission request metrics (rule + outcome)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub rule: String,
    pub outcome: Outcome,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("rule", self.rule.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-rule metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RuleLabels {
    pub rule: String,
}

impl EncodeLabelSet for RuleLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("rule", self.rule.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the injector
pub struct Metrics {
    /// Admission requests by rule and outcome
    pub admission_requests_total: Family<AdmissionLabels, Counter>,
    /// Patch operations returned per rule
    pub patch_operations_total: Family<RuleLabels, Counter>,
    /// Time spent building patches
    pub mutation_duration_seconds: Histogram,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_requests_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "sidecar_injector_admission_requests",
            "Total number of admission requests by rule and outcome",
            admission_requests_total.clone(),
        );

        let patch_operations_total = Family::<RuleLabels, Counter>::default();
        registry.register(
            "sidecar_injector_patch_operations",
            "Total number of JSON patch operations returned",
            patch_operations_total.clone(),
        );

        let mutation_duration_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 15));
        registry.register(
            "sidecar_injector_mutation_duration_seconds",
            "Time spent computing pod mutations in seconds",
            mutation_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            patch_operations_total,
            mutation_duration_seconds,
            registry,
        }
    }

    /// Record one admission request
    pub fn record_admission(&self, rule: &str, outcome: Outcome, operations: usize) {
        let labels = AdmissionLabels {
            rule: rule.to_string(),
            outcome,
        };
        self.admission_requests_total.get_or_create(&labels).inc();
        if operations > 0 {
            self.patch_operations_total
                .get_or_create(&RuleLabels {
                    rule: rule.to_string(),
                })
                .inc_by(operations as u64);
        }
    }

    /// Record how long a mutation took
    pub fn observe_mutation(&self, duration_secs: f64) {
        self.mutation_duration_seconds.observe(duration_secs);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the injector is ready (webhook registered and serving)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the injector as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the injector is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the webhook is registered.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `addr` (plain HTTP).
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(%addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
