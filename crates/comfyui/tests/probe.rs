//! Integration tests for the history probe and WebSocket push channel,
//! driven through the job monitor against a fake ComfyUI server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use atelier_comfyui::api::ComfyUIApi;
use atelier_comfyui::client::ComfyUIClient;
use atelier_comfyui::probe::{HistoryProbe, WebSocketPush};
use atelier_comfyui::reconnect::ReconnectConfig;
use atelier_core::job::{JobRecord, JobStatus, JobStore};
use atelier_core::monitor::{
    CompletionProbe, CompletionSource, JobMonitor, MonitorOutcome, MonitorSettings, ProbeStatus,
};
use atelier_core::types::BackendKind;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PROMPT_ID: &str = "prompt-1";
const IMAGE_BYTES: &[u8] = b"\x89PNG fake image";

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

struct Engine {
    /// History stays empty for this many requests.
    history_pending_for: usize,
    history_hits: AtomicUsize,
    /// Text frames sent to every WebSocket client, in order.
    ws_frames: Vec<String>,
    serve_ws: bool,
}

async fn history(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let n = engine.history_hits.fetch_add(1, Ordering::SeqCst);
    if id != PROMPT_ID || n < engine.history_pending_for {
        return Json(json!({}));
    }
    Json(json!({
        (PROMPT_ID): {
            "outputs": {
                "9": {"images": [{"filename": "flux_00001_.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

async fn view(Query(params): Query<std::collections::HashMap<String, String>>) -> impl IntoResponse {
    assert_eq!(params.get("filename").map(String::as_str), Some("flux_00001_.png"));
    assert_eq!(params.get("type").map(String::as_str), Some("output"));
    ([(header::CONTENT_TYPE, "image/png")], IMAGE_BYTES)
}

async fn ws(State(engine): State<Arc<Engine>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |mut socket| async move {
        for frame in &engine.ws_frames {
            if socket.send(Message::Text(frame.clone().into())).await.is_err() {
                return;
            }
        }
        // Hold the socket open until the client leaves.
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

async fn spawn_engine(engine: Engine) -> (String, Arc<Engine>) {
    let engine = Arc::new(engine);
    let mut app = Router::new()
        .route("/history/{id}", get(history))
        .route("/view", get(view));
    if engine.serve_ws {
        app = app.route("/ws", get(ws));
    }
    let app = app.with_state(Arc::clone(&engine));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), engine)
}

fn frames(prompt_id: &str, tail: serde_json::Value) -> Vec<String> {
    vec![
        json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}}).to_string(),
        json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}).to_string(),
        json!({"type": "progress", "data": {"value": 10, "max": 20, "prompt_id": prompt_id}}).to_string(),
        tail.to_string(),
    ]
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    }
}

async fn run_monitor(
    addr: &str,
    settings: MonitorSettings,
) -> (MonitorOutcome, Arc<JobStore>) {
    let store = Arc::new(JobStore::new());
    store
        .insert(JobRecord::new("job-1", BackendKind::LocalProcess).with_handle(PROMPT_ID))
        .await;
    let monitor = JobMonitor::new(Arc::clone(&store)).with_settings(settings);

    let probe = Arc::new(HistoryProbe::new(ComfyUIApi::new(format!("http://{addr}"))));
    let push = Arc::new(
        WebSocketPush::new(ComfyUIClient::new(format!("ws://{addr}"), "client-1"))
            .with_reconnect(fast_reconnect()),
    );

    let outcome = monitor
        .monitor("job-1", PROMPT_ID, Duration::from_secs(5), probe, Some(push), CancellationToken::new())
        .await;
    (outcome, store)
}

// ---------------------------------------------------------------------------
// Test: HistoryProbe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_probe_pending_then_completed() {
    let (addr, _) = spawn_engine(Engine {
        history_pending_for: 1,
        history_hits: AtomicUsize::new(0),
        ws_frames: Vec::new(),
        serve_ws: false,
    })
    .await;
    let probe = HistoryProbe::new(ComfyUIApi::new(format!("http://{addr}")));

    assert_matches!(
        probe.check(PROMPT_ID).await.unwrap(),
        ProbeStatus::Pending { progress: None }
    );
    match probe.check(PROMPT_ID).await.unwrap() {
        ProbeStatus::Completed(artifact) => {
            assert_eq!(artifact.filename, "flux_00001_.png");
            assert_eq!(artifact.content_type.as_deref(), Some("image/png"));
            assert_eq!(&artifact.data[..], IMAGE_BYTES);
        }
        other => panic!("Expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn history_probe_unreachable_engine_is_an_error() {
    let probe = HistoryProbe::new(ComfyUIApi::new("http://127.0.0.1:9"));
    assert!(probe.check(PROMPT_ID).await.is_err());
}

// ---------------------------------------------------------------------------
// Test: monitor over push + poll
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_completion_resolves_via_push() {
    let (addr, _) = spawn_engine(Engine {
        history_pending_for: 0,
        history_hits: AtomicUsize::new(0),
        ws_frames: frames(
            PROMPT_ID,
            json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}}),
        ),
        serve_ws: true,
    })
    .await;

    let settings = MonitorSettings {
        settle_delay: Duration::from_millis(20),
        initial_check_delay: Duration::from_secs(30),
        poll_interval: Duration::from_secs(30),
    };
    let (outcome, store) = run_monitor(&addr, settings).await;

    assert_matches!(
        outcome,
        MonitorOutcome::Completed { source: CompletionSource::Push, ref artifact }
            if &artifact.data[..] == IMAGE_BYTES
    );
    assert_eq!(store.get("job-1").await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn polling_resolves_when_websocket_is_unavailable() {
    let (addr, engine) = spawn_engine(Engine {
        history_pending_for: 2,
        history_hits: AtomicUsize::new(0),
        ws_frames: Vec::new(),
        serve_ws: false,
    })
    .await;

    let settings = MonitorSettings {
        settle_delay: Duration::from_millis(20),
        initial_check_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(30),
    };
    let (outcome, _) = run_monitor(&addr, settings).await;

    assert_matches!(outcome, MonitorOutcome::Completed { source: CompletionSource::Poll, .. });
    assert!(engine.history_hits.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn websocket_execution_error_fails_job() {
    let (addr, _) = spawn_engine(Engine {
        history_pending_for: usize::MAX,
        history_hits: AtomicUsize::new(0),
        ws_frames: frames(
            PROMPT_ID,
            json!({"type": "execution_error", "data": {
                "prompt_id": PROMPT_ID,
                "node_id": "31",
                "exception_message": "Error while deserializing header: HeaderTooLarge",
                "exception_type": "safetensors_rust.SafetensorError"
            }}),
        ),
        serve_ws: true,
    })
    .await;

    let settings = MonitorSettings {
        settle_delay: Duration::from_millis(20),
        initial_check_delay: Duration::from_secs(30),
        poll_interval: Duration::from_secs(30),
    };
    let (outcome, store) = run_monitor(&addr, settings).await;

    assert_matches!(
        outcome,
        MonitorOutcome::Failed { ref failure, source: CompletionSource::Push }
            if failure.message == "Error while deserializing header: HeaderTooLarge"
    );
    let record = store.get("job-1").await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.progress, Some(50));
}

#[tokio::test]
async fn events_for_other_prompts_are_ignored() {
    let (addr, _) = spawn_engine(Engine {
        history_pending_for: usize::MAX,
        history_hits: AtomicUsize::new(0),
        ws_frames: frames(
            "someone-else",
            json!({"type": "executing", "data": {"node": null, "prompt_id": "someone-else"}}),
        ),
        serve_ws: true,
    })
    .await;

    let store = Arc::new(JobStore::new());
    store.insert(JobRecord::new("job-1", BackendKind::LocalProcess)).await;
    let monitor = JobMonitor::new(Arc::clone(&store)).with_settings(MonitorSettings {
        settle_delay: Duration::from_millis(10),
        initial_check_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(20),
    });
    let probe = Arc::new(HistoryProbe::new(ComfyUIApi::new(format!("http://{addr}"))));
    let push = Arc::new(WebSocketPush::new(ComfyUIClient::new(format!("ws://{addr}"), "client-1")));

    let outcome = monitor
        .monitor("job-1", PROMPT_ID, Duration::from_millis(300), probe, Some(push), CancellationToken::new())
        .await;

    assert_matches!(outcome, MonitorOutcome::TimedOut);
    assert_eq!(store.get("job-1").await.unwrap().status, JobStatus::TimedOut);
}
