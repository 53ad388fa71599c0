//! Admission webhook server.
//!
//! Every rule is served on its own path, `<pathWebhook>/<fingerprint>`, so
//! the API server tells us which rule to apply through the URL it calls.
//! Anything after the base path is taken as the fingerprint; remainders that
//! name no rule are admitted unchanged.
//! Requests that cannot be decoded are rejected with 400. Everything else is
//! admitted: failures to mutate are reported in the response status message
//! and the pod goes through unchanged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::Handle;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::cert::TlsBundle;
use crate::config::ServerConfig;
use crate::health::{HealthState, Outcome};
use crate::mutation::{MutationEngine, MutationOutcome};

/// Time in-flight requests get to finish after a shutdown signal
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Listen address could not be parsed
    #[error("invalid listen address {address:?}: {source}")]
    ListenAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[source] std::io::Error),

    /// Server error
    #[error("webhook server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Shared state for webhook handlers
pub struct WebhookState {
    pub engine: MutationEngine,
    pub health: Option<Arc<HealthState>>,
}

impl WebhookState {
    pub fn new(engine: MutationEngine, health: Option<Arc<HealthState>>) -> Self {
        Self { engine, health }
    }

    fn record(&self, rule: &str, outcome: Outcome, operations: usize) {
        if let Some(health) = &self.health {
            health.metrics.record_admission(rule, outcome, operations);
        }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>, server: &ServerConfig) -> Router {
    let mutate_path = format!("{}/{{*fingerprint}}", server.path_webhook.trim_end_matches('/'));
    Router::new()
        .route(&server.path_healthcheck, get(healthcheck))
        .route(&mutate_path, post(mutate_pod))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

fn bad_request(message: String) -> Response {
    warn!(%message, "Rejecting admission request");
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
}

/// Mutating admission handler for one rule
async fn mutate_pod(
    State(state): State<Arc<WebhookState>>,
    Path(fingerprint): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json(&headers) {
        return bad_request("expected content type application/json".to_string());
    }
    if body.is_empty() {
        return bad_request("empty request body".to_string());
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => return bad_request(format!("failed to decode admission review: {e}")),
    };
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => return bad_request(format!("invalid admission review: {e}")),
    };

    let response = review_response(&state, &fingerprint, &request);
    (StatusCode::OK, Json(response.into_review())).into_response()
}

/// Build the admission response for a decoded request.
fn review_response(
    state: &WebhookState,
    fingerprint: &str,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let span = info_span!(
        "admission",
        uid = %request.uid,
        fingerprint = %fingerprint,
        namespace = request.namespace.as_deref().unwrap_or_default(),
        pod = request.name.as_str(),
    );
    let _entered = span.enter();

    let mut response = AdmissionResponse::from(request);

    if request.kind.kind != "Pod" || !request.kind.group.is_empty() {
        debug!(kind = %request.kind.kind, group = %request.kind.group, "Not a pod, admitting unchanged");
        state.record(fingerprint, Outcome::Ignored, 0);
        return response;
    }

    let pod = match decode_pod(request) {
        Ok(pod) => pod,
        Err(message) => {
            warn!(%message, "Failed to decode pod");
            state.record(fingerprint, Outcome::Error, 0);
            response.result.message = message;
            return response;
        }
    };

    let started = Instant::now();
    let outcome = state.engine.mutate(fingerprint, &pod);
    if let Some(health) = &state.health {
        health
            .metrics
            .observe_mutation(started.elapsed().as_secs_f64());
    }

    match outcome {
        Ok(MutationOutcome::Patched { rule, patch }) => {
            let operations = patch.0.len();
            match response.with_patch(patch) {
                Ok(patched) => {
                    info!(rule = %rule, operations, "Mutated pod");
                    state.record(&rule, Outcome::Patched, operations);
                    patched
                }
                Err(e) => {
                    error!(rule = %rule, error = %e, "Failed to serialize patch");
                    state.record(&rule, Outcome::Error, 0);
                    let mut response = AdmissionResponse::from(request);
                    response.result.message = format!("failed to serialize patch: {e}");
                    response
                }
            }
        }
        Ok(MutationOutcome::UnknownRule) => {
            state.record(fingerprint, Outcome::Ignored, 0);
            response
        }
        Ok(MutationOutcome::NothingToInject { rule })
        | Ok(MutationOutcome::IterationLimitReached { rule, .. }) => {
            state.record(&rule, Outcome::Skipped, 0);
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to mutate pod");
            let rule = state
                .engine
                .registry()
                .resolve(fingerprint)
                .map_or_else(|| fingerprint.to_string(), |r| r.display_name());
            state.record(&rule, Outcome::Error, 0);
            response.result.message = e.to_string();
            response
        }
    }
}

fn decode_pod(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, String> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| "admission request carries no object".to_string())?;
    let value =
        serde_json::to_value(object).map_err(|e| format!("failed to encode object: {e}"))?;
    serde_json::from_value(value).map_err(|e| format!("failed to decode pod: {e}"))
}

/// Run the webhook server with TLS until `handle` is told to shut down.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    server: &ServerConfig,
    tls: &TlsBundle,
    handle: Handle,
) -> Result<(), WebhookError> {
    let addr: SocketAddr =
        server
            .listen_address
            .parse()
            .map_err(|source| WebhookError::ListenAddress {
                address: server.listen_address.clone(),
                source,
            })?;
    let app = create_webhook_router(state, server);
    let config = tls.rustls_config().await.map_err(WebhookError::TlsConfig)?;

    info!(%addr, path = %server.path_webhook, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(WebhookError::Server)?;

    Ok(())
}
