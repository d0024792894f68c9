//! Durable task queue decoupling event intake from execution.
//!
//! Jobs are persisted as JSON records in a queue directory (see [`store`]).
//! Once [`TaskQueue::enqueue`] returns, the job survives a crash of the
//! process and will run after restart.
//!
//! # Identity
//!
//! Job IDs are deterministic per logical event. Enqueueing an ID that already
//! exists (in any state still retained) is a no-op reported as
//! `deduplicated`. This backs up the idempotency guard when two deliveries of
//! the same event race through intake.
//!
//! # Retries
//!
//! A job that fails with attempts left is parked as `delayed` with
//! exponential backoff and becomes leasable once due.
//!
//! # Retention
//!
//! Finished jobs are kept for inspection up to a cap per outcome. Failed jobs
//! get a larger cap than completed ones; the oldest records beyond a cap are
//! deleted.
//!
//! # Crash Recovery
//!
//! Jobs found `active` on open were interrupted mid-execution and go back to
//! `waiting`. Execution is therefore at-least-once.

pub mod job;
mod store;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use job::{JobHandle, JobRecord, JobState, LeasedJob};

use crate::executor::TaskResult;
use crate::types::{JobId, Task};

/// Default number of completed job records retained.
pub const DEFAULT_RETAIN_COMPLETED: usize = 100;

/// Default number of failed job records retained.
pub const DEFAULT_RETAIN_FAILED: usize = 500;

/// Default number of attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay before the first retry.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid job ID: contains unsafe characters: {0}")]
    InvalidJobId(JobId),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("job {0} is not active")]
    NotActive(JobId),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// How many finished jobs to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: usize,
    pub failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            completed: DEFAULT_RETAIN_COMPLETED,
            failed: DEFAULT_RETAIN_FAILED,
        }
    }
}

/// Retry behaviour for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempts` failed attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF)
    }
}

/// Configuration for a [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub retention: RetentionPolicy,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        QueueConfig {
            dir: dir.into(),
            retention: RetentionPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory index over the on-disk records.
#[derive(Debug, Default)]
struct QueueIndex {
    records: HashMap<JobId, JobRecord>,
    /// Ready jobs in FIFO order.
    waiting: VecDeque<JobId>,
    /// Jobs waiting out a retry delay, in no particular order.
    delayed: Vec<JobId>,
    /// Finished jobs, oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    active: usize,
    next_sequence: u64,
}

impl QueueIndex {
    /// Moves delayed jobs whose time has come to the back of the waiting
    /// queue, earliest first.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, u64, JobId)> = Vec::new();
        let records = &self.records;

        self.delayed.retain(|id| {
            let Some(record) = records.get(id) else {
                return false;
            };
            match record.not_before {
                Some(at) if at > now => true,
                _ => {
                    due.push((record.not_before.unwrap_or(now), record.sequence, id.clone()));
                    false
                }
            }
        });

        due.sort();
        for (_, _, id) in due {
            if let Some(record) = self.records.get_mut(&id) {
                record.state = JobState::Waiting;
                record.not_before = None;
            }
            self.waiting.push_back(id);
        }
    }

    /// Time until the earliest delayed job becomes due.
    fn next_due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.delayed
            .iter()
            .filter_map(|id| self.records.get(id)?.not_before)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// The durable task queue.
#[derive(Debug)]
pub struct TaskQueue {
    dir: PathBuf,
    retention: RetentionPolicy,
    retry: RetryPolicy,
    index: Mutex<QueueIndex>,
    ready: Notify,
}

impl TaskQueue {
    /// Opens (or creates) a queue directory and recovers its jobs.
    #[instrument(skip(config), fields(dir = %config.dir.display()))]
    pub fn open(config: QueueConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let mut records = store::load_records(&config.dir)?;
        records.sort_by_key(|r| r.sequence);

        let mut index = QueueIndex::default();
        let mut finished: Vec<(DateTime<Utc>, JobId, JobState)> = Vec::new();
        let mut recovered = 0usize;

        for mut record in records {
            index.next_sequence = index.next_sequence.max(record.sequence + 1);

            match record.state {
                JobState::Active => {
                    record.state = JobState::Waiting;
                    record.started_at = None;
                    store::write_record(&config.dir, &record)?;
                    recovered += 1;
                    index.waiting.push_back(record.id.clone());
                }
                JobState::Waiting => index.waiting.push_back(record.id.clone()),
                JobState::Delayed => index.delayed.push(record.id.clone()),
                JobState::Completed | JobState::Failed => {
                    finished.push((
                        record.finished_at.unwrap_or(record.enqueued_at),
                        record.id.clone(),
                        record.state,
                    ));
                }
            }

            index.records.insert(record.id.clone(), record);
        }

        finished.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        for (_, id, state) in finished {
            match state {
                JobState::Completed => index.completed.push_back(id),
                _ => index.failed.push_back(id),
            }
        }

        if recovered > 0 {
            warn!(
                recovered,
                "Requeued jobs interrupted by a previous shutdown"
            );
        }

        let mut queue = TaskQueue {
            dir: config.dir,
            retention: config.retention,
            retry: config.retry,
            index: Mutex::new(index),
            ready: Notify::new(),
        };

        {
            let index = queue.index.get_mut();
            enforce_retention(&queue.dir, &queue.retention, index)?;
            info!(
                waiting = index.waiting.len(),
                delayed = index.delayed.len(),
                completed = index.completed.len(),
                failed = index.failed.len(),
                "Task queue opened"
            );
        }

        Ok(queue)
    }

    /// Returns the queue directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Adds a job. Submitting an ID that is already known is a no-op.
    #[instrument(skip(self, task), fields(job_id = %job_id, task_type = %task.task_type))]
    pub async fn enqueue(&self, job_id: JobId, task: Task) -> Result<JobHandle> {
        store::validate_job_id(&job_id)?;
        let task_type = task.task_type;

        let mut index = self.index.lock().await;

        if index.records.contains_key(&job_id) {
            debug!("Job already queued (deduplicated)");
            return Ok(JobHandle {
                job_id,
                task_type,
                deduplicated: true,
            });
        }

        let record = JobRecord::new(
            job_id.clone(),
            task,
            index.next_sequence,
            self.retry.max_attempts.max(1),
        );

        // Persist before touching the index so a failed write leaves no trace.
        store::write_record(&self.dir, &record)?;

        index.next_sequence += 1;
        index.waiting.push_back(job_id.clone());
        index.records.insert(job_id.clone(), record);
        drop(index);

        self.ready.notify_one();
        debug!("Job enqueued");

        Ok(JobHandle {
            job_id,
            task_type,
            deduplicated: false,
        })
    }

    /// Leases the next due job, if any, without waiting.
    pub async fn lease(&self) -> Result<Option<LeasedJob>> {
        let mut index = self.index.lock().await;
        let now = Utc::now();
        index.promote_due(now);

        let Some(id) = index.waiting.pop_front() else {
            return Ok(None);
        };

        let Some(record) = index.records.get_mut(&id) else {
            return Err(QueueError::UnknownJob(id));
        };

        let previous = record.clone();
        record.state = JobState::Active;
        record.attempts += 1;
        record.started_at = Some(now);

        if let Err(e) = store::write_record(&self.dir, record) {
            *record = previous;
            index.waiting.push_front(id);
            return Err(e);
        }

        let leased = LeasedJob {
            id: record.id.clone(),
            task: record.task.clone(),
            attempt: record.attempts,
        };
        index.active += 1;

        Ok(Some(leased))
    }

    /// Waits for the next due job. Returns `None` once `cancel` fires.
    pub async fn next_job(&self, cancel: &CancellationToken) -> Result<Option<LeasedJob>> {
        loop {
            // Register interest before checking so an enqueue in between is
            // not missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.lease().await? {
                return Ok(Some(job));
            }

            let wait = self.index.lock().await.next_due_in(Utc::now());

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = notified => {}
                _ = async {
                    match wait {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    /// Records a finished execution. The executor's result is stored as-is,
    /// including structured failures.
    #[instrument(skip(self, result), fields(job_id = %job_id))]
    pub async fn complete(&self, job_id: &JobId, result: TaskResult) -> Result<()> {
        let mut index = self.index.lock().await;
        let mut record = active_record(&index, job_id)?.clone();

        record.state = JobState::Completed;
        record.finished_at = Some(Utc::now());
        record.result = Some(result);
        // A failed write leaves the job active so it can be settled again.
        store::write_record(&self.dir, &record)?;

        index.records.insert(job_id.clone(), record);
        index.active -= 1;
        index.completed.push_back(job_id.clone());
        enforce_retention(&self.dir, &self.retention, &mut index)?;

        Ok(())
    }

    /// Records a failed attempt. Retries with backoff while attempts remain;
    /// otherwise the job is marked failed.
    ///
    /// Returns the job's new state.
    #[instrument(skip(self, error), fields(job_id = %job_id))]
    pub async fn fail(&self, job_id: &JobId, error: &str) -> Result<JobState> {
        let mut index = self.index.lock().await;
        let mut record = active_record(&index, job_id)?.clone();

        record.error = Some(error.to_string());
        let now = Utc::now();

        let state = if record.can_retry() {
            let delay = self.retry.backoff(record.attempts);
            record.state = JobState::Delayed;
            record.not_before = Some(
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
            store::write_record(&self.dir, &record)?;
            debug!(
                attempt = record.attempts,
                delay_ms = delay.as_millis() as u64,
                "Job will be retried"
            );
            index.records.insert(job_id.clone(), record);
            index.delayed.push(job_id.clone());
            JobState::Delayed
        } else {
            record.state = JobState::Failed;
            record.finished_at = Some(now);
            store::write_record(&self.dir, &record)?;
            warn!(attempts = record.attempts, error, "Job failed permanently");
            index.records.insert(job_id.clone(), record);
            index.failed.push_back(job_id.clone());
            JobState::Failed
        };

        index.active -= 1;
        if state == JobState::Failed {
            enforce_retention(&self.dir, &self.retention, &mut index)?;
        }
        drop(index);

        if state == JobState::Delayed {
            // Wake a waiting slot so it re-arms its timer for the new due time.
            self.ready.notify_one();
        }

        Ok(state)
    }

    /// Returns a copy of a job record.
    pub async fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.index.lock().await.records.get(job_id).cloned()
    }

    /// Job counts by state.
    pub async fn stats(&self) -> QueueStats {
        let index = self.index.lock().await;
        QueueStats {
            waiting: index.waiting.len(),
            delayed: index.delayed.len(),
            active: index.active,
            completed: index.completed.len(),
            failed: index.failed.len(),
        }
    }
}

fn active_record<'a>(index: &'a QueueIndex, job_id: &JobId) -> Result<&'a JobRecord> {
    match index.records.get(job_id) {
        Some(record) if record.state == JobState::Active => Ok(record),
        Some(_) => Err(QueueError::NotActive(job_id.clone())),
        None => Err(QueueError::UnknownJob(job_id.clone())),
    }
}

/// Deletes the oldest finished records beyond the retention caps.
fn enforce_retention(dir: &Path, policy: &RetentionPolicy, index: &mut QueueIndex) -> Result<()> {
    let mut evicted = Vec::new();

    while index.completed.len() > policy.completed {
        if let Some(id) = index.completed.pop_front() {
            evicted.push(id);
        }
    }
    while index.failed.len() > policy.failed {
        if let Some(id) = index.failed.pop_front() {
            evicted.push(id);
        }
    }

    if evicted.is_empty() {
        return Ok(());
    }

    for id in &evicted {
        store::remove_record(dir, id)?;
        index.records.remove(id);
    }
    store::fsync_dir(dir)?;
    debug!(evicted = evicted.len(), "Pruned finished job records");

    Ok(())
}
