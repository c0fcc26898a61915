//! End-to-end dispatcher tests against fake backends: a ComfyUI engine,
//! the containerized service and the serverless queueing API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use atelier_core::config::{BackendConfig, ConfigStore, EngineConfig, PreferredBackend, ServerlessConfig};
use atelier_core::error::ErrorKind;
use atelier_core::job::{FailureKind, JobStatus};
use atelier_core::monitor::MonitorSettings;
use atelier_core::types::BackendKind;
use atelier_dispatch::dispatcher::{Dispatcher, DispatcherSettings};
use atelier_dispatch::error::DispatchError;
use atelier_dispatch::events::DispatchEvent;
use atelier_dispatch::request::JobRequest;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tokio::sync::broadcast;

const IMAGE_BYTES: &[u8] = b"\x89PNG generated";

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn fast_settings() -> DispatcherSettings {
    DispatcherSettings {
        job_timeout: Duration::from_secs(10),
        monitor: MonitorSettings {
            settle_delay: Duration::from_millis(20),
            initial_check_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
        },
        shutdown_grace: Duration::from_secs(2),
    }
}

fn dispatcher(config: BackendConfig) -> Dispatcher {
    Dispatcher::with_settings(ConfigStore::new(config), fast_settings())
}

async fn next_event(rx: &mut broadcast::Receiver<DispatchEvent>) -> DispatchEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("bus open")
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Fake containerized service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Service {
    status_hits: AtomicUsize,
}

async fn service_generate() -> Json<Value> {
    Json(json!({"job_id": "r-1", "status": "queued"}))
}

async fn service_kontext() -> Json<Value> {
    Json(json!({"job_id": "r-stuck"}))
}

async fn service_edit() -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"detail": "Model not loaded"}))).into_response()
}

async fn service_job(State(service): State<Arc<Service>>, Path(id): Path<String>) -> Response {
    match id.as_str() {
        "r-1" => {
            let hit = service.status_hits.fetch_add(1, Ordering::SeqCst);
            if hit == 0 {
                Json(json!({"status": "processing", "progress": 40.0})).into_response()
            } else {
                Json(json!({"status": "completed", "progress": 100.0})).into_response()
            }
        }
        "r-stuck" => Json(json!({"status": "processing", "progress": 10.0})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn service_image(Path(id): Path<String>) -> Response {
    if id != "r-1" {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, "image/png")], IMAGE_BYTES).into_response()
}

async fn spawn_service() -> (String, Arc<Service>) {
    let service = Arc::new(Service::default());
    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/generate/text-to-image", post(service_generate))
        .route("/generate/kontext", post(service_kontext))
        .route("/edit/image", post(service_edit))
        .route("/job/{id}", get(service_job))
        .route("/image/{id}", get(service_image))
        .with_state(Arc::clone(&service));
    (serve(app).await, service)
}

fn remote_config(url: &str) -> BackendConfig {
    BackendConfig {
        remote_service_url: url.to_string(),
        ..BackendConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fake serverless API
// ---------------------------------------------------------------------------

const ENDPOINT: &str = "ep-dispatch";

#[derive(Default)]
struct Serverless {
    inputs: Mutex<Vec<Value>>,
}

async fn serverless_run(State(api): State<Arc<Serverless>>, Json(body): Json<Value>) -> Json<Value> {
    let input = body["input"].clone();
    let id = if input["mode"] == "ok" { "sl-ok" } else { "sl-fail" };
    api.inputs.lock().unwrap().push(input);
    Json(json!({"id": id, "status": "IN_QUEUE"}))
}

async fn serverless_status(Path((_ep, id)): Path<(String, String)>) -> Response {
    match id.as_str() {
        "sl-fail" => Json(json!({
            "id": id,
            "status": "FAILED",
            "error": "CUDA error: out of memory"
        }))
        .into_response(),
        "sl-ok" => Json(json!({
            "id": id,
            "status": "COMPLETED",
            "output": {"images": [{"type": "base64", "data": BASE64.encode(IMAGE_BYTES), "filename": "kontext.png"}]}
        }))
        .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_serverless() -> (String, Arc<Serverless>) {
    let api = Arc::new(Serverless::default());
    let app = Router::new()
        .route("/{ep}/run", post(serverless_run))
        .route("/{ep}/status/{id}", get(serverless_status))
        .with_state(Arc::clone(&api));
    (serve(app).await, api)
}

fn serverless_config(base_url: &str) -> BackendConfig {
    BackendConfig {
        preferred: PreferredBackend::Serverless,
        serverless: ServerlessConfig {
            api_key: Some("rp_key".into()),
            endpoint_id: Some(ENDPOINT.into()),
            base_url: base_url.to_string(),
        },
        huggingface_token: Some("hf_secret".into()),
        ..BackendConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fake ComfyUI engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Comfy {
    prompts: Mutex<Vec<Value>>,
}

async fn comfy_prompt(State(comfy): State<Arc<Comfy>>, Json(body): Json<Value>) -> Json<Value> {
    comfy.prompts.lock().unwrap().push(body);
    Json(json!({"prompt_id": "prompt-1", "number": 0, "node_errors": {}}))
}

async fn comfy_history(Path(id): Path<String>) -> Json<Value> {
    if id != "prompt-1" {
        return Json(json!({}));
    }
    Json(json!({
        "prompt-1": {
            "outputs": {
                "9": {"images": [{"filename": "flux_00001_.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

async fn comfy_view() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], IMAGE_BYTES)
}

async fn spawn_comfy() -> (u16, Arc<Comfy>) {
    let comfy = Arc::new(Comfy::default());
    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/prompt", post(comfy_prompt))
        .route("/history/{id}", get(comfy_history))
        .route("/view", get(comfy_view))
        .with_state(Arc::clone(&comfy));
    let base = serve(app).await;
    let port = base.rsplit(':').next().unwrap().parse().unwrap();
    (port, comfy)
}

fn fake_install() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.py"), "print('engine')\n").unwrap();
    std::fs::create_dir(dir.path().join("custom_nodes")).unwrap();
    dir
}

// ---------------------------------------------------------------------------
// Serverless
// ---------------------------------------------------------------------------

#[tokio::test]
async fn serverless_failure_surfaces_provider_message() {
    let (base, api) = spawn_serverless().await;
    let dispatcher = dispatcher(serverless_config(&base));
    let mut events = dispatcher.subscribe_events();

    let job_id = dispatcher
        .submit(JobRequest::new(json!({"prompt": "a lighthouse"})))
        .await
        .unwrap();

    let err = dispatcher.await_result(&job_id).await.unwrap_err();
    assert_eq!(err.to_string(), "CUDA error: out of memory");
    assert_eq!(err.kind(), ErrorKind::JobBackend);

    let view = dispatcher.poll_status(&job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.backend, BackendKind::Serverless);
    assert_eq!(view.error.as_deref(), Some("CUDA error: out of memory"));

    assert_matches!(next_event(&mut events).await, DispatchEvent::Submitted { handle, .. } if handle == "sl-fail");
    assert_matches!(
        next_event(&mut events).await,
        DispatchEvent::Failed { kind: ErrorKind::JobBackend, message, .. } if message == "CUDA error: out of memory"
    );

    let inputs = api.inputs.lock().unwrap();
    assert_eq!(inputs[0]["hf_token"], "hf_secret");
    assert_eq!(inputs[0]["prompt"], "a lighthouse");
}

#[tokio::test]
async fn serverless_inline_output_is_returned() {
    let (base, _api) = spawn_serverless().await;
    let dispatcher = dispatcher(serverless_config(&base));

    let job_id = dispatcher
        .submit(JobRequest::new(json!({"mode": "ok"})))
        .await
        .unwrap();
    let artifact = dispatcher.await_result(&job_id).await.unwrap();

    assert_eq!(&*artifact.data, IMAGE_BYTES);
    assert_eq!(artifact.filename, "kontext.png");
}

#[tokio::test]
async fn preferred_serverless_without_credentials_is_a_configuration_error() {
    let (service_url, _) = spawn_service().await;
    let dispatcher = dispatcher(BackendConfig {
        preferred: PreferredBackend::Serverless,
        ..remote_config(&service_url)
    });

    let err = dispatcher
        .submit(JobRequest::new(json!({})))
        .await
        .unwrap_err();
    assert_matches!(err, DispatchError::Serverless(_));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(dispatcher.store().is_empty().await);
}

// ---------------------------------------------------------------------------
// Remote service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_service_is_the_fallback() {
    let (url, service) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));
    let mut events = dispatcher.subscribe_events();

    let job_id = dispatcher
        .submit(JobRequest::new(json!({"prompt": "a fox"})))
        .await
        .unwrap();

    assert_matches!(
        dispatcher.fetch_result(&job_id).await,
        Err(DispatchError::NotReady(id)) if id == job_id
    );

    let artifact = dispatcher.await_result(&job_id).await.unwrap();
    assert_eq!(&*artifact.data, IMAGE_BYTES);
    assert_eq!(artifact.filename, "r-1.png");
    assert_eq!(artifact.content_type.as_deref(), Some("image/png"));
    assert!(service.status_hits.load(Ordering::SeqCst) >= 2);

    let view = dispatcher.poll_status(&job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.backend, BackendKind::RemoteService);
    assert_eq!(view.error, None);

    assert_matches!(next_event(&mut events).await, DispatchEvent::Submitted { backend: BackendKind::RemoteService, .. });
    assert_matches!(next_event(&mut events).await, DispatchEvent::Completed { job_id: id, .. } if id == job_id);
}

#[tokio::test]
async fn remote_service_rejection_uses_detail() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));

    let err = dispatcher
        .submit(JobRequest::new(json!({})).with_route("edit/image"))
        .await
        .unwrap_err();
    assert_matches!(err, DispatchError::RemoteService(ref detail) if detail == "Model not loaded");
    assert_eq!(err.kind(), ErrorKind::JobBackend);
}

#[tokio::test]
async fn job_times_out() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));
    let mut events = dispatcher.subscribe_events();

    let job_id = dispatcher
        .submit(
            JobRequest::new(json!({}))
                .with_route("generate/kontext")
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    let err = dispatcher.await_result(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobTimeout);
    assert_eq!(
        dispatcher.poll_status(&job_id).await.unwrap().status,
        JobStatus::TimedOut
    );

    next_event(&mut events).await;
    assert_matches!(next_event(&mut events).await, DispatchEvent::TimedOut { .. });
}

// ---------------------------------------------------------------------------
// Local engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthy_local_engine_is_adopted() {
    let (port, comfy) = spawn_comfy().await;
    let (service_url, service) = spawn_service().await;
    let install = fake_install();

    let mut engine = EngineConfig::new(install.path());
    engine.port = port;
    engine.autostart = false;
    let dispatcher = dispatcher(BackendConfig {
        engine: Some(engine),
        ..remote_config(&service_url)
    });

    let workflow = json!({"3": {"class_type": "KSampler", "inputs": {}}});
    let job_id = dispatcher
        .submit(JobRequest::new(workflow.clone()))
        .await
        .unwrap();

    let artifact = dispatcher.await_result(&job_id).await.unwrap();
    assert_eq!(&*artifact.data, IMAGE_BYTES);
    assert_eq!(artifact.filename, "flux_00001_.png");

    let record = dispatcher.store().get(&job_id).await.unwrap();
    assert_eq!(record.backend, BackendKind::LocalProcess);
    assert_eq!(record.handle.as_deref(), Some("prompt-1"));

    {
        let prompts = comfy.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0]["client_id"], dispatcher.client_id());
        assert_eq!(prompts[0]["prompt"], workflow);
    }
    assert_eq!(service.status_hits.load(Ordering::SeqCst), 0);

    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn stopped_engine_without_autostart_falls_back() {
    let (service_url, _) = spawn_service().await;
    let install = fake_install();

    let mut engine = EngineConfig::new(install.path());
    engine.port = closed_port().await;
    engine.autostart = false;
    let dispatcher = dispatcher(BackendConfig {
        engine: Some(engine),
        ..remote_config(&service_url)
    });

    let job_id = dispatcher.submit(JobRequest::new(json!({}))).await.unwrap();
    assert_eq!(
        dispatcher.poll_status(&job_id).await.unwrap().backend,
        BackendKind::RemoteService
    );
}

#[tokio::test]
async fn autostart_with_broken_installation_propagates() {
    let (service_url, _) = spawn_service().await;
    let install = tempfile::tempdir().unwrap();

    let mut engine = EngineConfig::new(install.path());
    engine.port = closed_port().await;
    engine.autostart = true;
    let dispatcher = dispatcher(BackendConfig {
        engine: Some(engine),
        ..remote_config(&service_url)
    });

    let err = dispatcher.submit(JobRequest::new(json!({}))).await.unwrap_err();
    assert_matches!(err, DispatchError::Engine(_));
    assert_eq!(err.kind(), ErrorKind::InstallationInvalid);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_resolves_job_as_cancelled() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));

    let job_id = dispatcher
        .submit(JobRequest::new(json!({})).with_route("generate/kontext"))
        .await
        .unwrap();

    assert!(dispatcher.cancel(&job_id).await.unwrap());
    let err = dispatcher.await_result(&job_id).await.unwrap_err();
    assert_matches!(err, DispatchError::Job(ref failure) if failure.kind == FailureKind::Cancelled);
    assert_eq!(dispatcher.poll_status(&job_id).await.unwrap().status, JobStatus::Failed);

    assert!(!dispatcher.cancel(&job_id).await.unwrap());
}

#[tokio::test]
async fn cancel_after_completion_reports_false_and_keeps_artifact() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));

    let job_id = dispatcher.submit(JobRequest::new(json!({}))).await.unwrap();
    dispatcher.await_result(&job_id).await.unwrap();

    assert!(!dispatcher.cancel(&job_id).await.unwrap());
    assert_eq!(dispatcher.poll_status(&job_id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(dispatcher.fetch_result(&job_id).await.unwrap().filename, "r-1.png");
}

#[tokio::test]
async fn forget_drops_only_finished_jobs() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));

    let stuck = dispatcher
        .submit(JobRequest::new(json!({})).with_route("generate/kontext"))
        .await
        .unwrap();
    assert!(!dispatcher.forget(&stuck).await.unwrap());
    assert!(!dispatcher.poll_status(&stuck).await.unwrap().status.is_terminal());

    let done = dispatcher.submit(JobRequest::new(json!({}))).await.unwrap();
    dispatcher.await_result(&done).await.unwrap();
    assert!(dispatcher.forget(&done).await.unwrap());
    assert_matches!(dispatcher.poll_status(&done).await, Err(DispatchError::UnknownJob(_)));
    assert_matches!(dispatcher.forget(&done).await, Err(DispatchError::UnknownJob(_)));
    assert_eq!(dispatcher.store().len().await, 1);

    assert!(dispatcher.cancel(&stuck).await.unwrap());
    assert!(dispatcher.forget(&stuck).await.unwrap());
    assert!(dispatcher.store().is_empty().await);
}

#[tokio::test]
async fn unknown_job_ids_are_rejected() {
    let dispatcher = dispatcher(BackendConfig::default());

    assert_matches!(dispatcher.poll_status("nope").await, Err(DispatchError::UnknownJob(_)));
    assert_matches!(dispatcher.fetch_result("nope").await, Err(DispatchError::UnknownJob(_)));
    assert_matches!(dispatcher.await_result("nope").await, Err(DispatchError::UnknownJob(_)));
    let err = dispatcher.cancel("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_jobs() {
    let (url, _) = spawn_service().await;
    let dispatcher = dispatcher(remote_config(&url));

    let job_id = dispatcher
        .submit(JobRequest::new(json!({})).with_route("generate/kontext"))
        .await
        .unwrap();

    dispatcher.shutdown().await.unwrap();

    let record = dispatcher.store().get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_matches!(
        dispatcher.submit(JobRequest::new(json!({}))).await,
        Err(DispatchError::ShutDown)
    );
}

#[tokio::test]
async fn configuration_changes_apply_to_the_next_submission() {
    let (service_url, _) = spawn_service().await;
    let (serverless_url, _) = spawn_serverless().await;
    let store = ConfigStore::new(remote_config(&service_url));
    let dispatcher = Dispatcher::with_settings(store.clone(), fast_settings());

    let first = dispatcher.submit(JobRequest::new(json!({}))).await.unwrap();
    store.replace(BackendConfig {
        remote_service_url: service_url.clone(),
        ..serverless_config(&serverless_url)
    });
    let second = dispatcher
        .submit(JobRequest::new(json!({"mode": "ok"})))
        .await
        .unwrap();

    assert_eq!(
        dispatcher.poll_status(&first).await.unwrap().backend,
        BackendKind::RemoteService
    );
    assert_eq!(
        dispatcher.poll_status(&second).await.unwrap().backend,
        BackendKind::Serverless
    );
}
