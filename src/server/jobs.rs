//! Job inspection endpoint.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::AppState;
use crate::queue::JobRecord;
use crate::types::JobId;

#[derive(Debug, Error)]
pub enum JobLookupError {
    /// Never enqueued, or already pruned by retention.
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl IntoResponse for JobLookupError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobLookupError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// `GET /jobs/{job_id}`
///
/// Returns the job record, including the executor's result once finished.
pub async fn job_handler(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, JobLookupError> {
    let job_id = JobId::new(job_id);
    match app_state.queue().get(&job_id).await {
        Some(record) => Ok(Json(record)),
        None => Err(JobLookupError::NotFound(job_id)),
    }
}
