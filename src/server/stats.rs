//! Queue and intake counters.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;
use crate::queue::QueueStats;

/// Counts of events accepted without enqueueing anything.
#[derive(Debug, Default)]
pub struct IgnoredCounters {
    unrecognized_type: AtomicU64,
    no_next_task: AtomicU64,
}

impl IgnoredCounters {
    pub fn record_unrecognized_type(&self) {
        self.unrecognized_type.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_next_task(&self) {
        self.no_next_task.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IgnoredStats {
        IgnoredStats {
            unrecognized_type: self.unrecognized_type.load(Ordering::Relaxed),
            no_next_task: self.no_next_task.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredStats {
    pub unrecognized_type: u64,
    pub no_next_task: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub idempotency_keys: usize,
    pub ignored: IgnoredStats,
}

/// `GET /stats`
pub async fn stats_handler(State(app_state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        queue: app_state.queue().stats().await,
        idempotency_keys: app_state.idempotency().len(),
        ignored: app_state.ignored().snapshot(),
    })
}
