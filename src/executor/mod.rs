//! Command executors: one per task type.
//!
//! Executors turn a [`Task`] into a [`TaskResult`]. A process that exits
//! non-zero, times out or cannot be spawned is still a *result*
//! ([`TaskResult::Failure`]) and completes the job. A task that is malformed
//! for its type (a shell task with no command, a skill task with no skill)
//! is a [`ValidationError`] and fails the job, subject to the queue's retry
//! policy.

mod noop;
mod process;
mod shell;
mod skill;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use noop::NoopExecutor;
pub use process::{MAX_CAPTURE_BYTES, MAX_OUTPUT_CHARS, truncate_output};
pub use shell::{CreatePrExecutor, ShellExecutor, create_pr_command, shell_quote};
pub use skill::SkillExecutor;

use crate::types::{Task, TaskType};

/// Default timeout for shell-based tasks.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default timeout for skill runs.
pub const DEFAULT_SKILL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default skill runner program.
pub const DEFAULT_SKILL_RUNNER: &str = "skill-runner";

/// Default command for `run_tests` tasks.
pub const DEFAULT_TEST_COMMAND: &str = "npm test";

/// Default command for `build` tasks.
pub const DEFAULT_BUILD_COMMAND: &str = "npm run build";

/// Outcome of running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all_fields = "camelCase")]
pub enum TaskResult {
    #[serde(rename = "success")]
    Success {
        /// Structured output, if the executor produces any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "failed")]
    Failure {
        error: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        timed_out: bool,
    },
}

impl TaskResult {
    /// The result of a `noop` task.
    pub fn noop() -> Self {
        TaskResult::Success {
            output: Some(serde_json::json!({ "message": "noop" })),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    /// A failure with no process output.
    pub fn failure(error: impl Into<String>) -> Self {
        TaskResult::Failure {
            error: error.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, TaskResult::Failure { timed_out: true, .. })
    }
}

/// A task that cannot be executed as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{task_type} task requires a non-empty command")]
    MissingCommand { task_type: TaskType },

    #[error("run_skill task requires a non-empty skill")]
    MissingSkill,

    #[error("parameter {name:?} is invalid: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("no executor registered for task type {0}")]
    Unsupported(TaskType),
}

/// Runs tasks of one type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError>;
}

/// Tunables shared by the built-in executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub skill_runner: String,
    pub shell_timeout: Duration,
    pub skill_timeout: Duration,
    /// Per-stream byte cap on captured output.
    pub max_capture_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings {
            skill_runner: DEFAULT_SKILL_RUNNER.to_string(),
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            skill_timeout: DEFAULT_SKILL_TIMEOUT,
            max_capture_bytes: MAX_CAPTURE_BYTES,
        }
    }
}

/// Maps task types to executors and dispatches on `task.task_type`.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    /// An empty registry. Every task fails validation until executors are
    /// registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in executor for every task type.
    pub fn with_defaults(settings: &ExecutorSettings) -> Self {
        let shell = |default: Option<&str>| {
            Arc::new(ShellExecutor::new(
                default.map(str::to_string),
                settings.shell_timeout,
                settings.max_capture_bytes,
            ))
        };

        ExecutorRegistry::new()
            .register(TaskType::Shell, shell(None))
            .register(TaskType::RunTests, shell(Some(DEFAULT_TEST_COMMAND)))
            .register(TaskType::Build, shell(Some(DEFAULT_BUILD_COMMAND)))
            .register(
                TaskType::CreatePr,
                Arc::new(CreatePrExecutor::new(
                    settings.shell_timeout,
                    settings.max_capture_bytes,
                )),
            )
            .register(
                TaskType::RunSkill,
                Arc::new(SkillExecutor::new(
                    settings.skill_runner.clone(),
                    settings.skill_timeout,
                    settings.max_capture_bytes,
                )),
            )
            .register(TaskType::Noop, Arc::new(NoopExecutor))
    }

    pub fn register(mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(task_type, executor);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.executors.keys().map(TaskType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &types)
            .finish()
    }
}

#[async_trait]
impl TaskExecutor for ExecutorRegistry {
    async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError> {
        match self.executors.get(&task.task_type) {
            Some(executor) => executor.execute(task).await,
            None => Err(ValidationError::Unsupported(task.task_type)),
        }
    }
}
