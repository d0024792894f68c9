//! HTTP server for the workflow dispatcher.
//!
//! # Endpoints
//!
//! - `POST /events` - Accepts signed `StopDetected` events
//! - `GET /jobs/{job_id}` - Returns a job record as JSON
//! - `GET /stats` - Queue, idempotency and ignored-event counters
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

pub mod events;
pub mod health;
pub mod jobs;
pub mod stats;

pub use events::{IntakeError, IntakeResponse, events_handler};
pub use health::health_handler;
pub use jobs::job_handler;
pub use stats::{IgnoredCounters, stats_handler};

use crate::dedupe::IdempotencyStore;
use crate::queue::TaskQueue;
use crate::workflow::WorkflowGraph;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Shared secret for HMAC-SHA256 signature verification.
    secret: Vec<u8>,
    idempotency: Arc<dyn IdempotencyStore>,
    graph: Arc<WorkflowGraph>,
    queue: Arc<TaskQueue>,
    /// Log ignored events at info rather than debug.
    log_ignored: bool,
    ignored: IgnoredCounters,
}

impl AppState {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        idempotency: Arc<dyn IdempotencyStore>,
        graph: Arc<WorkflowGraph>,
        queue: Arc<TaskQueue>,
        log_ignored: bool,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                secret: secret.into(),
                idempotency,
                graph,
                queue,
                log_ignored,
                ignored: IgnoredCounters::default(),
            }),
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.inner.secret
    }

    pub fn idempotency(&self) -> &dyn IdempotencyStore {
        self.inner.idempotency.as_ref()
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.inner.graph
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn log_ignored(&self) -> bool {
        self.inner.log_ignored
    }

    pub fn ignored(&self) -> &IgnoredCounters {
        &self.inner.ignored
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/events", post(events_handler))
        .route("/jobs/{job_id}", get(job_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    use crate::dedupe::WindowedIdempotencyStore;
    use crate::queue::{JobState, QueueConfig};
    use crate::test_utils::{TEST_SECRET, sign, stop_event_json};
    use crate::types::IdempotencyKey;

    /// Creates a test app state over the built-in workflow and a temporary
    /// queue directory.
    fn test_app_state() -> (AppState, TempDir) {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::open(QueueConfig::new(dir.path())).unwrap();
        let state = AppState::new(
            TEST_SECRET.to_vec(),
            Arc::new(WindowedIdempotencyStore::default()),
            Arc::new(WorkflowGraph::builtin()),
            Arc::new(queue),
            false,
        );
        (state, dir)
    }

    fn signed_request(body: &[u8], signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .header("x-signature", signature)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    fn event_request(event: &Value) -> Request<Body> {
        let body = serde_json::to_vec(event).unwrap();
        signed_request(&body, &sign(&body))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    // ─── Intake ───

    #[tokio::test]
    async fn stop_event_is_enqueued() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());

        let (status, body) = send(
            &app,
            event_request(&stop_event_json("default", "ai_output_complete", "k1")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "enqueued");
        assert_eq!(body["taskType"], "shell");
        let job_id = body["jobId"].as_str().unwrap();
        assert!(job_id.starts_with("default:shell:"), "{job_id}");

        let (status, job) = send(&app, get(&format!("/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["state"], "waiting");
        assert_eq!(job["task"]["payload"]["command"], "npm test");
        assert_eq!(job["task"]["payload"]["stepId"], "run_tests");
        assert_eq!(job["task"]["payload"]["triggerStepId"], "ai_output_complete");
    }

    #[tokio::test]
    async fn duplicate_event_enqueues_once() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());
        let event = stop_event_json("default", "ai_output_complete", "k1");

        let (_, first) = send(&app, event_request(&event)).await;
        assert_eq!(first["status"], "enqueued");

        let (status, second) = send(&app, event_request(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, json!({ "status": "duplicate", "key": "k1" }));

        assert_eq!(state.queue().stats().await.waiting, 1);
    }

    #[tokio::test]
    async fn event_already_in_queue_is_duplicate() {
        // Two intake states sharing a queue but not a key store: the second
        // delivery passes the key check and is caught by the job ID.
        let dir = tempdir().unwrap();
        let queue = Arc::new(TaskQueue::open(QueueConfig::new(dir.path())).unwrap());
        let intake = |queue: Arc<TaskQueue>| {
            AppState::new(
                TEST_SECRET.to_vec(),
                Arc::new(WindowedIdempotencyStore::default()),
                Arc::new(WorkflowGraph::builtin()),
                queue,
                false,
            )
        };
        let state = intake(queue.clone());
        let other = intake(queue);
        let event = stop_event_json("default", "ai_output_complete", "k1");

        let (_, first) = send(&build_router(state.clone()), event_request(&event)).await;
        assert_eq!(first["status"], "enqueued");

        let (status, second) = send(&build_router(other.clone()), event_request(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, json!({ "status": "duplicate", "key": "k1" }));

        assert_eq!(state.queue().stats().await.waiting, 1);
        assert!(other.idempotency().seen(&IdempotencyKey::new("k1")));
    }

    #[tokio::test]
    async fn concurrent_duplicates_enqueue_once() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());
        let event = stop_event_json("default", "ai_output_complete", "k1");

        let (a, b) = tokio::join!(
            send(&app, event_request(&event)),
            send(&app, event_request(&event)),
        );
        assert_eq!(a.0, StatusCode::OK);
        assert_eq!(b.0, StatusCode::OK);

        let mut statuses = [a.1["status"].clone(), b.1["status"].clone()];
        statuses.sort_by_key(|s| s.to_string());
        assert_eq!(statuses, [json!("duplicate"), json!("enqueued")]);
        assert_eq!(state.queue().stats().await.waiting, 1);
    }

    #[tokio::test]
    async fn distinct_keys_enqueue_distinct_jobs() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());

        let (_, a) = send(
            &app,
            event_request(&stop_event_json("default", "ai_output_complete", "k1")),
        )
        .await;
        let (_, b) = send(
            &app,
            event_request(&stop_event_json("default", "ai_output_complete", "k2")),
        )
        .await;

        assert_ne!(a["jobId"], b["jobId"]);
        assert_eq!(state.queue().stats().await.waiting, 2);
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());
        let mut event = stop_event_json("default", "ai_output_complete", "k1");
        event["type"] = json!("SessionStarted");

        let (status, body) = send(&app, event_request(&event)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({ "status": "ignored" }));

        let (_, stats) = send(&app, get("/stats")).await;
        assert_eq!(stats["ignored"]["unrecognizedType"], 1);
        assert_eq!(stats["queue"]["waiting"], 0);
        assert_eq!(stats["idempotencyKeys"], 0);
    }

    #[tokio::test]
    async fn missing_signature_returns_401() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());
        let body = serde_json::to_vec(&stop_event_json("default", "ai_output_complete", "k1")).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.queue().stats().await.waiting, 0);
    }

    #[tokio::test]
    async fn tampered_body_returns_401() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());

        let original =
            serde_json::to_vec(&stop_event_json("default", "ai_output_complete", "k1")).unwrap();
        let signature = sign(&original);
        let tampered =
            serde_json::to_vec(&stop_event_json("default", "ai_output_complete", "k2")).unwrap();

        let (status, _) = send(&app, signed_request(&tampered, &signature)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.queue().stats().await.waiting, 0);
        assert!(state.idempotency().is_empty());
    }

    #[tokio::test]
    async fn prefixed_signature_accepted() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);
        let body =
            serde_json::to_vec(&stop_event_json("default", "ai_output_complete", "k1")).unwrap();

        let (status, response) =
            send(&app, signed_request(&body, &format!("sha256={}", sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "enqueued");
    }

    #[tokio::test]
    async fn non_json_body_returns_400() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);
        let body = b"not json";

        let (status, response) = send(&app, signed_request(body, &sign(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response["error"].as_str().unwrap().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn incomplete_stop_event_returns_400() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);

        let (status, _) = send(
            &app,
            event_request(&json!({ "type": "StopDetected", "workflowId": "default" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn last_step_has_no_next_task() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());
        let event = stop_event_json("default", "create_pr", "k-last");

        let (status, body) = send(&app, event_request(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "no_next_task" }));

        // Handled events are remembered even when nothing was queued.
        let (_, again) = send(&app, event_request(&event)).await;
        assert_eq!(again["status"], "duplicate");

        let (_, stats) = send(&app, get("/stats")).await;
        assert_eq!(stats["ignored"]["noNextTask"], 1);
        assert_eq!(stats["idempotencyKeys"], 1);
    }

    #[tokio::test]
    async fn unknown_workflow_uses_fallback() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);

        let (status, body) = send(
            &app,
            event_request(&stop_event_json("some-other-workflow", "run_tests", "k1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "enqueued");
        assert!(body["jobId"].as_str().unwrap().starts_with("default:"));
    }

    #[tokio::test]
    async fn failed_enqueue_returns_500_and_allows_retry() {
        let (state, dir) = test_app_state();
        let app = build_router(state.clone());
        let event = stop_event_json("default", "ai_output_complete", "k1");

        std::fs::remove_dir_all(dir.path()).unwrap();
        let (status, _) = send(&app, event_request(&event)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.idempotency().is_empty());

        std::fs::create_dir_all(dir.path()).unwrap();
        let (status, body) = send(&app, event_request(&event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "enqueued");
    }

    // ─── Inspection ───

    #[tokio::test]
    async fn health_returns_ok() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn unknown_job_returns_404() {
        let (state, _dir) = test_app_state();
        let app = build_router(state);

        let (status, body) = send(&app, get("/jobs/default:shell:0000000000000000")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn finished_job_shows_result() {
        let (state, _dir) = test_app_state();
        let app = build_router(state.clone());

        let (_, body) = send(
            &app,
            event_request(&stop_event_json("default", "ai_output_complete", "k1")),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let job = state.queue().lease().await.unwrap().unwrap();
        state
            .queue()
            .complete(&job.id, crate::executor::TaskResult::noop())
            .await
            .unwrap();

        let (status, record) = send(&app, get(&format!("/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["state"], "completed");
        assert_eq!(record["result"]["status"], "success");

        let (_, stats) = send(&app, get("/stats")).await;
        assert_eq!(stats["queue"]["completed"], 1);
        assert_eq!(
            state.queue().get(&job.id).await.unwrap().state,
            JobState::Completed
        );
    }
}
