//! Bounded pool of execution slots draining the task queue.
//!
//! Each slot is a tokio task looping lease → execute → record, so at most
//! `concurrency` executions are ever in flight. A slot stays occupied for the
//! whole execution, including an executor's timeout window.
//!
//! # Outcomes
//!
//! - The executor returns a [`TaskResult`] (success or structured failure):
//!   the job is completed with that result.
//! - The executor returns a [`ValidationError`] or panics: the job is failed
//!   and the queue's retry policy decides whether it runs again.
//!
//! # Shutdown
//!
//! Cancelling the pool's token stops slots from leasing new jobs. Executions
//! already in flight run to completion.
//!
//! [`TaskResult`]: crate::executor::TaskResult
//! [`ValidationError`]: crate::executor::ValidationError

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::TaskExecutor;
use crate::queue::{JobState, LeasedJob, TaskQueue};

/// Default number of concurrent executions.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Pause after a queue error before a slot tries to lease again.
const LEASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A pool of execution slots, not yet started.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    concurrency: usize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool. A concurrency of zero is treated as one.
    pub fn new(
        queue: Arc<TaskQueue>,
        executor: Arc<dyn TaskExecutor>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        WorkerPool {
            queue,
            executor,
            concurrency: concurrency.max(1),
            shutdown,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawns one task per slot.
    pub fn spawn(self) -> WorkerPoolHandle {
        let mut slots = JoinSet::new();

        for slot in 0..self.concurrency {
            let queue = self.queue.clone();
            let executor = self.executor.clone();
            let shutdown = self.shutdown.child_token();
            slots.spawn(run_slot(slot, queue, executor, shutdown));
        }

        info!(concurrency = self.concurrency, "Worker pool started");

        WorkerPoolHandle {
            shutdown: self.shutdown,
            slots,
        }
    }
}

/// A running pool.
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    slots: JoinSet<()>,
}

impl WorkerPoolHandle {
    /// Stops leasing and waits for in-flight executions to finish.
    pub async fn shutdown(mut self) {
        info!("Shutting down worker pool");
        self.shutdown.cancel();

        while let Some(joined) = self.slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot ended abnormally");
            }
        }

        info!("Worker pool stopped");
    }
}

async fn run_slot(
    slot: usize,
    queue: Arc<TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    shutdown: CancellationToken,
) {
    debug!(slot, "Worker slot started");

    loop {
        let job = match queue.next_job(&shutdown).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                error!(slot, error = %e, "Failed to lease job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(LEASE_RETRY_DELAY) => continue,
                }
            }
        };

        process_job(slot, &queue, &executor, job).await;
    }

    debug!(slot, "Worker slot stopped");
}

#[instrument(skip_all, fields(slot = slot, job_id = %job.id, task_type = %job.task.task_type, attempt = job.attempt))]
async fn process_job(
    slot: usize,
    queue: &TaskQueue,
    executor: &Arc<dyn TaskExecutor>,
    job: LeasedJob,
) {
    info!("Executing job");

    // Run on its own task so a panicking executor is contained.
    let outcome = {
        let executor = executor.clone();
        let task = job.task.clone();
        tokio::spawn(async move { executor.execute(&task).await }).await
    };

    let recorded = match outcome {
        Ok(Ok(result)) => {
            info!(success = result.is_success(), "Job completed");
            queue.complete(&job.id, result).await
        }
        Ok(Err(invalid)) => {
            warn!(error = %invalid, "Task rejected by executor");
            queue.fail(&job.id, &invalid.to_string()).await.map(log_failed)
        }
        Err(e) => {
            error!(error = %e, "Executor panicked");
            queue
                .fail(&job.id, &format!("executor panicked: {e}"))
                .await
                .map(log_failed)
        }
    };

    if let Err(e) = recorded {
        error!(error = %e, "Failed to record job outcome");
    }
}

fn log_failed(state: JobState) {
    match state {
        JobState::Delayed => debug!("Job scheduled for retry"),
        _ => debug!(state = ?state, "Job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{TaskResult, ValidationError};
    use crate::queue::{QueueConfig, RetryPolicy};
    use crate::test_utils::{noop_task, shell_task};
    use crate::types::{JobId, Task};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Sleeps while tracking how many executions overlap.
    #[derive(Default)]
    struct CountingExecutor {
        active: AtomicUsize,
        max_active: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _task: &Task) -> Result<TaskResult, ValidationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(TaskResult::noop())
        }
    }

    struct RejectingExecutor;

    #[async_trait]
    impl TaskExecutor for RejectingExecutor {
        async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError> {
            Err(ValidationError::MissingCommand {
                task_type: task.task_type,
            })
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(&self, _task: &Task) -> Result<TaskResult, ValidationError> {
            panic!("executor bug");
        }
    }

    fn queue() -> (TempDir, Arc<TaskQueue>) {
        let dir = tempdir().unwrap();
        let queue = TaskQueue::open(QueueConfig::new(dir.path()).with_retry(RetryPolicy {
            max_attempts: 1,
            backoff_base: Duration::from_millis(10),
        }))
        .unwrap();
        (dir, Arc::new(queue))
    }

    async fn wait_until_finished(queue: &TaskQueue, total: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let stats = queue.stats().await;
                if stats.completed + stats.failed == total {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not finish in time");
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let (_dir, queue) = queue();
        let executor = Arc::new(CountingExecutor::default());

        for i in 0..12 {
            queue
                .enqueue(JobId::new(format!("wf:noop:{i}")), noop_task())
                .await
                .unwrap();
        }

        let handle = WorkerPool::new(queue.clone(), executor.clone(), 3, CancellationToken::new())
            .spawn();
        wait_until_finished(&queue, 12).await;
        handle.shutdown().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 12);
        let max = executor.max_active.load(Ordering::SeqCst);
        assert!((1..=3).contains(&max), "max concurrent executions was {max}");
        assert_eq!(queue.stats().await.completed, 12);
    }

    #[tokio::test]
    async fn jobs_enqueued_after_start_are_picked_up() {
        let (_dir, queue) = queue();
        let executor = Arc::new(CountingExecutor::default());
        let handle = WorkerPool::new(queue.clone(), executor.clone(), 2, CancellationToken::new())
            .spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(JobId::new("wf:noop:late"), noop_task()).await.unwrap();

        wait_until_finished(&queue, 1).await;
        handle.shutdown().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_error_fails_job() {
        let (_dir, queue) = queue();
        let id = JobId::new("wf:shell:bad");
        queue.enqueue(id.clone(), shell_task("")).await.unwrap();

        let handle =
            WorkerPool::new(queue.clone(), Arc::new(RejectingExecutor), 1, CancellationToken::new())
                .spawn();
        wait_until_finished(&queue, 1).await;
        handle.shutdown().await;

        let record = queue.get(&id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().contains("requires a non-empty command"));
    }

    #[tokio::test]
    async fn panicking_executor_fails_job_and_slot_survives() {
        let (_dir, queue) = queue();
        queue.enqueue(JobId::new("wf:noop:1"), noop_task()).await.unwrap();
        queue.enqueue(JobId::new("wf:noop:2"), noop_task()).await.unwrap();

        let handle =
            WorkerPool::new(queue.clone(), Arc::new(PanickingExecutor), 1, CancellationToken::new())
                .spawn();
        wait_until_finished(&queue, 2).await;
        handle.shutdown().await;

        let record = queue.get(&JobId::new("wf:noop:1")).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn no_leasing_after_shutdown() {
        let (_dir, queue) = queue();
        let executor = Arc::new(CountingExecutor::default());
        let handle = WorkerPool::new(queue.clone(), executor.clone(), 2, CancellationToken::new())
            .spawn();
        handle.shutdown().await;

        queue.enqueue(JobId::new("wf:noop:1"), noop_task()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().await.waiting, 1);
    }

    #[test]
    fn zero_concurrency_clamped() {
        let (_dir, queue) = queue();
        let pool = WorkerPool::new(
            queue,
            Arc::new(RejectingExecutor),
            0,
            CancellationToken::new(),
        );
        assert_eq!(pool.concurrency(), 1);
    }
}
