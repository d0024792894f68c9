//! `run_skill` executor: hands a task to an external skill runner.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::process::{self, ProcessOutcome, ProcessSpec};
use super::shell::{task_cwd, task_env};
use super::{TaskExecutor, TaskResult, ValidationError, truncate_output};
use crate::types::Task;

/// Runs `<runner> <skill>` with the task params as JSON on stdin.
///
/// Stdout is parsed as JSON into the result's `output` before the stored
/// `stdout` is truncated, so JSON of any size up to the capture cap survives.
/// Output that is not JSON is kept as a truncated string.
#[derive(Debug, Clone)]
pub struct SkillExecutor {
    runner: String,
    timeout: Duration,
    max_capture: usize,
}

impl SkillExecutor {
    pub fn new(runner: String, timeout: Duration, max_capture: usize) -> Self {
        SkillExecutor {
            runner,
            timeout,
            max_capture,
        }
    }
}

#[async_trait]
impl TaskExecutor for SkillExecutor {
    #[instrument(skip(self, task), fields(workflow_id = %task.payload.workflow_id, skill = tracing::field::Empty))]
    async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError> {
        let skill = task
            .payload
            .skill
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingSkill)?;
        tracing::Span::current().record("skill", skill);

        let stdin = serde_json::to_vec(&task.payload.params).map_err(|e| {
            ValidationError::InvalidParam {
                name: "params".to_string(),
                reason: e.to_string(),
            }
        })?;

        let spec = ProcessSpec {
            program: self.runner.clone(),
            args: vec![skill.to_string()],
            cwd: task_cwd(&task.payload)?,
            envs: task_env(&task.payload),
            stdin: Some(stdin),
            timeout: self.timeout,
            max_capture: self.max_capture,
        };

        let outcome = process::run(&spec).await;
        let output = match &outcome {
            ProcessOutcome::Exited { status, stdout, .. } if status.success() => {
                Some(parse_output(stdout))
            }
            _ => None,
        };

        let result = match outcome.into_task_result(&spec) {
            TaskResult::Success {
                stdout,
                stderr,
                exit_code,
                ..
            } => TaskResult::Success {
                output,
                stdout,
                stderr,
                exit_code,
            },
            failure => failure,
        };

        info!(success = result.is_success(), "Skill finished");
        Ok(result)
    }
}

fn parse_output(stdout: &str) -> serde_json::Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::Value::String(truncate_output(trimmed)))
}
