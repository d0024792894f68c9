//! Job records: the queue's wrapper around a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::TaskResult;
use crate::types::{JobId, Task, TaskType};

/// Lifecycle state of a job.
///
/// ```text
/// waiting ──lease──► active ──complete──► completed
///    ▲                 │
///    │                 └──fail──► delayed (attempts left) ──due──► waiting
///    │                       └──► failed (attempts exhausted)
///    └── active on startup (interrupted by a crash)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Returns true for states that will not change again.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub task: Task,
    pub state: JobState,
    /// Number of times the job has been leased.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Enqueue order, for FIFO leasing across restarts.
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a delayed job may run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Executor result, set when the job completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    /// Creates a waiting job.
    pub fn new(id: JobId, task: Task, sequence: u64, max_attempts: u32) -> Self {
        JobRecord {
            id,
            task,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts,
            sequence,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            not_before: None,
            result: None,
            error: None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.task.task_type
    }

    /// Returns true if another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: JobId,
    pub task_type: TaskType,
    /// True if a job with this ID already existed and nothing new was queued.
    pub deduplicated: bool,
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: JobId,
    pub task: Task,
    /// 1-based attempt number.
    pub attempt: u32,
}
