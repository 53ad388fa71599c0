//! Admission endpoint tests driven through the webhook router.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use json_patch::Patch;
use k8s_openapi::ByteString;
use kube_sidecar_injector::config::ServerConfig;
use kube_sidecar_injector::health::HealthState;
use kube_sidecar_injector::webhooks::{WebhookState, create_webhook_router};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::fixtures::{PREFIX, PodBuilder, apply, engine_for, node_exporter_rule};

struct Harness {
    router: Router,
    health: Arc<HealthState>,
    fingerprint: String,
}

fn harness() -> Harness {
    let (engine, fingerprint) = engine_for(node_exporter_rule());
    let health = Arc::new(HealthState::new());
    let state = Arc::new(WebhookState::new(engine, Some(health.clone())));
    Harness {
        router: create_webhook_router(state, &ServerConfig::default()),
        health,
        fingerprint,
    }
}

fn review(api_version: &str, kind: Value, object: Value) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": kind,
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "web",
            "namespace": "default",
            "operation": "CREATE",
            "userInfo": {"username": "admin"},
            "object": object,
            "dryRun": false
        }
    })
}

fn pod_kind() -> Value {
    json!({"group": "", "version": "v1", "kind": "Pod"})
}

fn pod_review() -> Value {
    let pod = PodBuilder::new("web").container("nginx").build();
    review("admission.k8s.io/v1", pod_kind(), serde_json::to_value(pod).unwrap())
}

async fn post(
    router: &Router,
    uri: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method("POST").uri(uri);
    if let Some(content_type) = content_type {
        request = request.header(header::CONTENT_TYPE, content_type);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn admit(router: &Router, uri: &str, review: &Value) -> Value {
    let (status, body) = post(
        router,
        uri,
        Some("application/json"),
        serde_json::to_vec(review).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

/// The patch travels as a JSON array of bytes; base64 strings are accepted too.
fn decode_patch(response: &Value) -> Patch {
    let bytes = match &response["patch"] {
        Value::String(_) => {
            serde_json::from_value::<ByteString>(response["patch"].clone())
                .unwrap()
                .0
        }
        other => serde_json::from_value::<Vec<u8>>(other.clone()).unwrap(),
    };
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_pod_is_patched() {
    let h = harness();
    let review = pod_review();
    let body = admit(&h.router, &format!("/mutate/{}", h.fingerprint), &review).await;

    assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
    let response = &body["response"];
    assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert_eq!(response["allowed"], true);
    assert_eq!(response["patchType"], "JSONPatch");

    let pod = serde_json::from_value(review["request"]["object"].clone()).unwrap();
    let patched = apply(&pod, &decode_patch(response));
    let names: Vec<String> = patched
        .spec
        .unwrap()
        .containers
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, ["nginx", "node-exporter"]);
    let annotations = patched.metadata.annotations.unwrap();
    assert_eq!(annotations[&format!("{PREFIX}/{}", h.fingerprint)], "1");

    let metrics = h.health.metrics.encode();
    assert!(metrics.contains(r#"rule="node-exporter",outcome="patched""#), "{metrics}");
}

#[tokio::test]
async fn test_v1beta1_review_echoes_version() {
    let h = harness();
    let mut review = pod_review();
    review["apiVersion"] = json!("admission.k8s.io/v1beta1");

    let body = admit(&h.router, &format!("/mutate/{}", h.fingerprint), &review).await;
    assert_eq!(body["apiVersion"], "admission.k8s.io/v1beta1");
    assert_eq!(body["response"]["allowed"], true);
    assert_eq!(body["response"]["patchType"], "JSONPatch");
}

#[tokio::test]
async fn test_non_pod_is_admitted_unchanged() {
    let h = harness();
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default"}
    });
    let review = review(
        "admission.k8s.io/v1",
        json!({"group": "apps", "version": "v1", "kind": "Deployment"}),
        deployment,
    );

    let body = admit(&h.router, &format!("/mutate/{}", h.fingerprint), &review).await;
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"]["patch"].is_null());
}

#[tokio::test]
async fn test_unknown_fingerprint_is_admitted_unchanged() {
    let h = harness();
    let body = admit(&h.router, "/mutate/ffffffffffffffff", &pod_review()).await;
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"]["patch"].is_null());
}

#[tokio::test]
async fn test_extra_path_segments_are_an_unknown_rule() {
    let h = harness();
    let uri = format!("/mutate/{}/extra", h.fingerprint);
    let body = admit(&h.router, &uri, &pod_review()).await;
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"]["patch"].is_null());
}

#[tokio::test]
async fn test_already_mutated_pod_gets_no_patch() {
    let h = harness();
    let uri = format!("/mutate/{}", h.fingerprint);
    let review = pod_review();
    let first = admit(&h.router, &uri, &review).await;

    let pod = serde_json::from_value(review["request"]["object"].clone()).unwrap();
    let patched = apply(&pod, &decode_patch(&first["response"]));
    let again = self::review(
        "admission.k8s.io/v1",
        pod_kind(),
        serde_json::to_value(patched).unwrap(),
    );

    let second = admit(&h.router, &uri, &again).await;
    assert_eq!(second["response"]["allowed"], true);
    assert!(second["response"]["patch"].is_null());
}

#[tokio::test]
async fn test_mutation_failure_is_reported_not_denied() {
    let h = harness();
    let object = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "web", "namespace": "default"}
    });
    let review = review("admission.k8s.io/v1", pod_kind(), object);

    let body = admit(&h.router, &format!("/mutate/{}", h.fingerprint), &review).await;
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"]["patch"].is_null());
    let message = body["response"]["status"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("no spec"), "{body}");
}

#[tokio::test]
async fn test_wrong_content_type_rejected() {
    let h = harness();
    let (status, _) = post(
        &h.router,
        &format!("/mutate/{}", h.fingerprint),
        Some("text/plain"),
        serde_json::to_vec(&pod_review()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_content_type_rejected() {
    let h = harness();
    let (status, _) = post(
        &h.router,
        &format!("/mutate/{}", h.fingerprint),
        None,
        serde_json::to_vec(&pod_review()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_body_rejected() {
    let h = harness();
    let (status, body) = post(
        &h.router,
        &format!("/mutate/{}", h.fingerprint),
        Some("application/json"),
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("empty"));
}

#[tokio::test]
async fn test_malformed_review_rejected() {
    let h = harness();
    let (status, _) = post(
        &h.router,
        &format!("/mutate/{}", h.fingerprint),
        Some("application/json"),
        b"{\"apiVersion\": ".to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_review_without_request_rejected() {
    let h = harness();
    let review = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
    let (status, _) = post(
        &h.router,
        &format!("/mutate/{}", h.fingerprint),
        Some("application/json"),
        serde_json::to_vec(&review).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_healthcheck_path() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
