//! Integration tests for the serverless client against a fake queueing API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use atelier_core::error::ErrorKind;
use atelier_core::job::FailureKind;
use atelier_core::monitor::{CompletionProbe, ProbeStatus};
use atelier_serverless::client::{JobState, ServerlessClient, ServerlessError};
use atelier_serverless::probe::ServerlessProbe;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};

const ENDPOINT: &str = "ep-test";
const API_KEY: &str = "rp_test_key";

// ---------------------------------------------------------------------------
// Fake API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Api {
    base: Mutex<String>,
    submitted: Mutex<Vec<Value>>,
    status_hits: Mutex<HashMap<String, usize>>,
    cancelled: AtomicUsize,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"))
}

async fn run(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    api.submitted.lock().unwrap().push(body);
    Json(json!({"id": "job-1", "status": "IN_QUEUE"})).into_response()
}

async fn status(
    State(api): State<Arc<Api>>,
    Path((_ep, id)): Path<(String, String)>,
) -> Response {
    let hit = {
        let mut hits = api.status_hits.lock().unwrap();
        let n = hits.entry(id.clone()).or_default();
        *n += 1;
        *n
    };
    let base = api.base.lock().unwrap().clone();

    let body = match (id.as_str(), hit) {
        ("job-1", 1) => json!({"id": id, "status": "IN_PROGRESS"}),
        ("job-1", _) => json!({"id": id, "status": "COMPLETED", "output": {"images": [
            {"type": "base64", "data": BASE64.encode(b"png"), "filename": "ComfyUI_00001_.png"}
        ]}}),
        ("late", 1) => json!({"id": id, "status": "COMPLETED"}),
        ("late", _) => json!({"id": id, "status": "COMPLETED", "output": {"text": "late words"}}),
        ("empty", _) => json!({"id": id, "status": "COMPLETED"}),
        ("broken", _) => json!({"id": id, "status": "FAILED", "error": "CUDA error: out of memory"}),
        ("bare-fail", _) => json!({"id": id, "status": "FAILED"}),
        ("s3", _) => json!({"id": id, "status": "COMPLETED", "output": {"images": [
            {"type": "s3_url", "data": format!("{base}/blob/out.png"), "filename": "out.png"}
        ]}}),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    Json(body).into_response()
}

async fn cancel(State(api): State<Arc<Api>>, Path((_ep, id)): Path<(String, String)>) -> Response {
    if id == "gone" {
        return StatusCode::NOT_FOUND.into_response();
    }
    api.cancelled.fetch_add(1, Ordering::SeqCst);
    Json(json!({"id": id, "status": "CANCELLED"})).into_response()
}

async fn health() -> Json<Value> {
    Json(json!({
        "jobs": {"completed": 3, "failed": 0, "inProgress": 1, "inQueue": 2, "retried": 0},
        "workers": {"idle": 0, "running": 1}
    }))
}

async fn blob(headers: HeaderMap) -> impl IntoResponse {
    assert!(headers.get(header::AUTHORIZATION).is_none(), "API key leaked to storage");
    ([(header::CONTENT_TYPE, "image/png")], &b"from-bucket"[..])
}

async fn spawn_api() -> (ServerlessClient, Arc<Api>) {
    let api = Arc::new(Api::default());
    let app = Router::new()
        .route("/{ep}/run", post(run))
        .route("/{ep}/status/{id}", get(status))
        .route("/{ep}/cancel/{id}", post(cancel))
        .route("/{ep}/health", get(health))
        .route("/blob/out.png", get(blob))
        .with_state(Arc::clone(&api));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    *api.base.lock().unwrap() = format!("http://{addr}");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = ServerlessClient::new(format!("http://{addr}"), ENDPOINT, API_KEY)
        .with_output_retry_delay(Duration::from_millis(20));
    (client, api)
}

// ---------------------------------------------------------------------------
// Test: run / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_wraps_input_and_returns_id() {
    let (client, api) = spawn_api().await;

    let id = client.run(json!({"workflow": {"3": {}}})).await.unwrap();

    assert_eq!(id, "job-1");
    assert_eq!(
        api.submitted.lock().unwrap()[0],
        json!({"input": {"workflow": {"3": {}}}})
    );
}

#[tokio::test]
async fn wrong_key_is_api_error() {
    let (_, api) = spawn_api().await;
    let base = api.base.lock().unwrap().clone();
    let bad = ServerlessClient::new(base, ENDPOINT, "wrong");

    assert_matches!(bad.run(json!({})).await, Err(ServerlessError::Api { status: 401, .. }));
}

#[tokio::test]
async fn poll_pending_then_inline_image() {
    let (client, _) = spawn_api().await;

    assert_eq!(client.poll("job-1").await.unwrap(), JobState::Pending);
    match client.poll("job-1").await.unwrap() {
        JobState::Completed(artifact) => {
            assert_eq!(artifact.filename, "ComfyUI_00001_.png");
            assert_eq!(&artifact.data[..], b"png");
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn completed_without_output_is_retried_once() {
    let (client, api) = spawn_api().await;

    let state = client.poll("late").await.unwrap();

    assert_matches!(state, JobState::Completed(a) if a.filename == "transcription_late.json");
    assert_eq!(api.status_hits.lock().unwrap()["late"], 2);
}

#[tokio::test]
async fn completed_without_output_after_retry_is_an_error() {
    let (client, api) = spawn_api().await;

    assert_matches!(client.poll("empty").await, Err(ServerlessError::NoOutput));
    assert_eq!(api.status_hits.lock().unwrap()["empty"], 2);
}

#[tokio::test]
async fn failed_status_carries_provider_error_verbatim() {
    let (client, _) = spawn_api().await;

    assert_eq!(
        client.poll("broken").await.unwrap(),
        JobState::Failed("CUDA error: out of memory".into())
    );
    assert_eq!(
        client.poll("bare-fail").await.unwrap(),
        JobState::Failed("Job failed".into())
    );
}

#[tokio::test]
async fn reference_output_is_fetched_without_api_key() {
    let (client, _) = spawn_api().await;

    match client.poll("s3").await.unwrap() {
        JobState::Completed(artifact) => {
            assert_eq!(artifact.filename, "out.png");
            assert_eq!(&artifact.data[..], b"from-bucket");
            assert_eq!(artifact.content_type.as_deref(), Some("image/png"));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (client, _) = spawn_api().await;

    let err = client.poll("expired").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

// ---------------------------------------------------------------------------
// Test: cancel / health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_and_health() {
    let (client, api) = spawn_api().await;

    client.cancel("job-1").await.unwrap();
    assert_eq!(api.cancelled.load(Ordering::SeqCst), 1);
    assert_matches!(client.cancel("gone").await, Err(ServerlessError::NotFound(_)));

    let health = client.health().await.unwrap();
    assert_eq!(health.jobs.in_queue, 2);
    assert_eq!(health.workers.running, 1);
}

// ---------------------------------------------------------------------------
// Test: probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn probe_maps_states() {
    let (client, _) = spawn_api().await;
    let probe = ServerlessProbe::new(client);

    assert_matches!(probe.check("job-1").await.unwrap(), ProbeStatus::Pending { .. });
    assert_matches!(probe.check("job-1").await.unwrap(), ProbeStatus::Completed(_));
    assert_matches!(
        probe.check("broken").await.unwrap(),
        ProbeStatus::Failed(f) if f.kind == FailureKind::Backend && f.message == "CUDA error: out of memory"
    );
    assert_matches!(
        probe.check("expired").await.unwrap(),
        ProbeStatus::Failed(f) if f.kind == FailureKind::NotFound
    );
}

#[tokio::test]
async fn probe_reports_unreachable_api_as_transient() {
    let probe = ServerlessProbe::new(ServerlessClient::new("http://127.0.0.1:9", ENDPOINT, API_KEY));
    assert!(probe.check("job-1").await.is_err());
}
