//! Integration tests for the HTTP API.
//!
//! Serves the router on an ephemeral port over a registry of fake kernels
//! and exercises it with `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use kernel_gateway::models::execution::ExecutionResult;
use kernel_gateway::models::session::{SessionInfo, SessionState};

use super::test_helpers::{fake_registry, spawn_api};

// ── GET /health ──────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;

    let resp = reqwest::get(format!("{base_url}/health"))
        .await
        .expect("HTTP GET /health");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");
    ct.cancel();
}

// ── POST /run-cell ───────────────────────────────────────────

/// Running code without a kernel id starts one and returns the result.
#[tokio::test]
async fn run_cell_starts_kernel_and_returns_result() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(Arc::clone(&registry)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "code": "1+1" }))
        .send()
        .await
        .expect("POST /run-cell");
    assert_eq!(resp.status(), 200);

    let result: ExecutionResult = resp.json().await.expect("result body");
    assert!(result.success);
    assert_eq!(
        result.execute_result.as_ref().and_then(|d| d.plain_text()),
        Some("2")
    );
    registry.get(&result.session_id).await.expect("kernel registered");

    let again = client
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "kernel_id": result.session_id, "code": "print('hi')" }))
        .send()
        .await
        .expect("second run");
    let body: Value = again.json().await.expect("json");
    assert_eq!(body["stdout"], "hi\n");
    assert_eq!(body["kernel_id"], json!(result.session_id));
    ct.cancel();
}

/// Empty code is a 400 whose detail explains the expected body.
#[tokio::test]
async fn run_cell_empty_code_is_bad_request() {
    let (registry, launcher) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "kernel_id": "", "code": "" }))
        .send()
        .await
        .expect("POST");

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    let detail = body["detail"].as_str().expect("detail");
    assert!(detail.contains("\"code\""), "detail: {detail}");
    assert_eq!(launcher.launches(), 0);
    ct.cancel();
}

/// A body that is not JSON is a 400, not a framework-specific status.
#[tokio::test]
async fn run_cell_malformed_body_is_bad_request() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/run-cell"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("POST");

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    assert!(body["detail"].is_string());
    ct.cancel();
}

/// An unknown kernel id is a 404.
#[tokio::test]
async fn run_cell_unknown_kernel_is_not_found() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "kernel_id": "nonexistent-id", "code": "1" }))
        .send()
        .await
        .expect("POST");

    assert_eq!(resp.status(), 404);
    ct.cancel();
}

/// A kernel dying mid-execution is a 500 with the execution prefix.
#[tokio::test]
async fn run_cell_transport_fault_is_server_error() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(Arc::clone(&registry)).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "code": "die" }))
        .send()
        .await
        .expect("POST");

    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.expect("json");
    let detail = body["detail"].as_str().expect("detail");
    assert!(detail.starts_with("Error executing code:"), "detail: {detail}");
    assert!(registry.is_empty().await);
    ct.cancel();
}

/// A busy kernel answers 409 with `Retry-After`, and interrupting it via
/// the API finishes the first request.
#[tokio::test]
async fn busy_kernel_is_conflict_and_interruptible() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(Arc::clone(&registry)).await;
    let client = reqwest::Client::new();

    let session = registry.start(None).await.expect("start");
    let id = session.id().to_owned();

    let first = tokio::spawn({
        let client = client.clone();
        let url = format!("{base_url}/run-cell");
        let id = id.clone();
        async move {
            client
                .post(url)
                .json(&json!({ "kernel_id": id, "code": "sleep" }))
                .send()
                .await
        }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.state() != SessionState::Busy {
        assert!(tokio::time::Instant::now() < deadline, "never became busy");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let busy = client
        .post(format!("{base_url}/run-cell"))
        .json(&json!({ "kernel_id": id, "code": "1+1" }))
        .send()
        .await
        .expect("second POST");
    assert_eq!(busy.status(), 409);
    assert_eq!(
        busy.headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let interrupted = client
        .post(format!("{base_url}/kernels/{id}/interrupt"))
        .send()
        .await
        .expect("interrupt");
    assert_eq!(interrupted.status(), 204);

    let first = first.await.expect("join").expect("first response");
    assert_eq!(first.status(), 200);
    let result: ExecutionResult = first.json().await.expect("json");
    assert!(!result.success);
    ct.cancel();
}

// ── /kernels ─────────────────────────────────────────────────

/// Create, list, and delete a kernel.
#[tokio::test]
async fn kernel_crud_round_trip() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{base_url}/kernels"))
        .send()
        .await
        .expect("POST /kernels");
    assert_eq!(created.status(), 201);
    let body: Value = created.json().await.expect("json");
    let id = body["kernel_id"].as_str().expect("kernel_id").to_owned();

    let listed: Vec<SessionInfo> = client
        .get(format!("{base_url}/kernels"))
        .send()
        .await
        .expect("GET /kernels")
        .json()
        .await
        .expect("json");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].kernel_id, id);
    assert_eq!(listed[0].kernel_name, "fake");
    assert_eq!(listed[0].state, SessionState::Idle);

    let deleted = client
        .delete(format!("{base_url}/kernels/{id}"))
        .send()
        .await
        .expect("DELETE");
    assert_eq!(deleted.status(), 204);

    let again = client
        .delete(format!("{base_url}/kernels/{id}"))
        .send()
        .await
        .expect("DELETE again");
    assert_eq!(again.status(), 404);
    ct.cancel();
}

/// Creating a kernel from an unknown spec is a 400; over capacity is a 503.
#[tokio::test]
async fn create_kernel_errors() {
    let (registry, _) = fake_registry(1);
    let (base_url, ct) = spawn_api(registry).await;
    let client = reqwest::Client::new();

    let unknown = client
        .post(format!("{base_url}/kernels"))
        .json(&json!({ "kernel_name": "cobol" }))
        .send()
        .await
        .expect("POST");
    assert_eq!(unknown.status(), 400);

    let first = client
        .post(format!("{base_url}/kernels"))
        .json(&json!({}))
        .send()
        .await
        .expect("POST");
    assert_eq!(first.status(), 201);

    let full = client
        .post(format!("{base_url}/kernels"))
        .send()
        .await
        .expect("POST");
    assert_eq!(full.status(), 503);
    assert_eq!(
        full.headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    ct.cancel();
}

/// Interrupting an unknown kernel is a 404.
#[tokio::test]
async fn interrupt_unknown_kernel_is_not_found() {
    let (registry, _) = fake_registry(4);
    let (base_url, ct) = spawn_api(registry).await;

    let resp = reqwest::Client::new()
        .post(format!("{base_url}/kernels/missing/interrupt"))
        .send()
        .await
        .expect("POST");
    assert_eq!(resp.status(), 404);
    ct.cancel();
}
