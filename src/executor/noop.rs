use async_trait::async_trait;

use super::{TaskExecutor, TaskResult, ValidationError};
use crate::types::Task;

/// Does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _task: &Task) -> Result<TaskResult, ValidationError> {
        Ok(TaskResult::noop())
    }
}
