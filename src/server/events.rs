//! Event intake endpoint.
//!
//! Verifies, deduplicates and resolves "step completed" events, then enqueues
//! the next task. The handler never waits for execution.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::queue::QueueError;
use crate::types::{JobId, STOP_EVENT_TYPE, StopEvent, TaskType, event_type_of};
use crate::webhooks::verify_signature;

/// Header carrying the hex HMAC-SHA256 of the raw body.
const HEADER_SIGNATURE: &str = "x-signature";

/// Errors that reject an event.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("invalid StopDetected event: {0}")]
    InvalidEvent(#[source] serde_json::Error),

    #[error("failed to enqueue task: {0}")]
    Queue(#[from] QueueError),
}

impl IntakeError {
    fn status(&self) -> StatusCode {
        match self {
            IntakeError::MissingSignature | IntakeError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            IntakeError::InvalidJson(_) | IntakeError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            IntakeError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Outcome of an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeResponse {
    Ignored,
    Duplicate {
        key: String,
    },
    NoNextTask,
    #[serde(rename_all = "camelCase")]
    Enqueued {
        job_id: JobId,
        task_type: TaskType,
    },
}

impl IntakeResponse {
    fn status(&self) -> StatusCode {
        match self {
            IntakeResponse::Ignored => StatusCode::ACCEPTED,
            _ => StatusCode::OK,
        }
    }
}

impl IntoResponse for IntakeResponse {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// `POST /events`
///
/// # Response
///
/// - 200 `{"status":"enqueued","jobId":...,"taskType":...}`
/// - 200 `{"status":"duplicate","key":...}`
/// - 200 `{"status":"no_next_task"}`
/// - 202 `{"status":"ignored"}` for event types other than `StopDetected`
/// - 400 body is not JSON or not a valid event
/// - 401 missing or invalid signature
/// - 500 the task could not be enqueued
pub async fn events_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<IntakeResponse, IntakeError> {
    let Some(signature) = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
    else {
        warn!("Event rejected: missing signature");
        return Err(IntakeError::MissingSignature);
    };

    // Verify before parsing anything.
    if !verify_signature(&body, signature, app_state.secret()) {
        warn!("Event rejected: invalid signature");
        return Err(IntakeError::InvalidSignature);
    }

    let raw: serde_json::Value = serde_json::from_slice(&body).map_err(IntakeError::InvalidJson)?;

    let event_type = event_type_of(&raw);
    if event_type != Some(STOP_EVENT_TYPE) {
        app_state.ignored().record_unrecognized_type();
        if app_state.log_ignored() {
            info!(event_type = ?event_type, "Ignoring event of unrecognized type");
        } else {
            debug!(event_type = ?event_type, "Ignoring event of unrecognized type");
        }
        return Ok(IntakeResponse::Ignored);
    }

    let event: StopEvent = serde_json::from_value(raw).map_err(IntakeError::InvalidEvent)?;
    let key = event.idempotency_key();

    if app_state.idempotency().seen(&key) {
        debug!(key = %key, "Duplicate event");
        return Ok(IntakeResponse::Duplicate {
            key: key.to_string(),
        });
    }

    let Some((workflow_id, task)) = app_state.graph().decide_next_task(&event) else {
        app_state.idempotency().mark_seen(&key);
        app_state.ignored().record_no_next_task();
        if app_state.log_ignored() {
            info!(
                workflow_id = %event.workflow_id,
                step_id = %event.step_id,
                "No next task for event"
            );
        } else {
            debug!(
                workflow_id = %event.workflow_id,
                step_id = %event.step_id,
                "No next task for event"
            );
        }
        return Ok(IntakeResponse::NoNextTask);
    };

    let job_id = JobId::for_event(&workflow_id, task.task_type, &key);
    let handle = app_state
        .queue()
        .enqueue(job_id, task)
        .await
        .inspect_err(|e| error!(key = %key, error = %e, "Failed to enqueue task"))?;

    // Marked only after the job is durable so a failed enqueue can be retried.
    app_state.idempotency().mark_seen(&key);

    if handle.deduplicated {
        debug!(key = %key, job_id = %handle.job_id, "Event already queued");
        return Ok(IntakeResponse::Duplicate {
            key: key.to_string(),
        });
    }

    info!(
        key = %key,
        job_id = %handle.job_id,
        task_type = %handle.task_type,
        run_id = %event.run_id,
        "Task enqueued"
    );

    Ok(IntakeResponse::Enqueued {
        job_id: handle.job_id,
        task_type: handle.task_type,
    })
}
