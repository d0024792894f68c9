//! Shell-backed executors: `shell`, `run_tests`, `build` and `create_pr`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::process::{self, ProcessSpec};
use super::{TaskExecutor, TaskResult, ValidationError};
use crate::types::{Task, TaskPayload};

/// Runs `sh -c <command>`.
///
/// The command comes from the task; executors built with a default command
/// (`run_tests`, `build`) fall back to it when the task has none.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    default_command: Option<String>,
    timeout: Duration,
    max_capture: usize,
}

impl ShellExecutor {
    pub fn new(default_command: Option<String>, timeout: Duration, max_capture: usize) -> Self {
        ShellExecutor {
            default_command,
            timeout,
            max_capture,
        }
    }

    fn command<'a>(&'a self, task: &'a Task) -> Result<&'a str, ValidationError> {
        task.payload
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .or(self.default_command.as_deref())
            .ok_or(ValidationError::MissingCommand {
                task_type: task.task_type,
            })
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError> {
        let command = self.command(task)?;
        run_shell(command, &task.payload, self.timeout, self.max_capture).await
    }
}

/// Opens a pull request with `gh pr create`.
#[derive(Debug, Clone)]
pub struct CreatePrExecutor {
    timeout: Duration,
    max_capture: usize,
}

impl CreatePrExecutor {
    pub fn new(timeout: Duration, max_capture: usize) -> Self {
        CreatePrExecutor {
            timeout,
            max_capture,
        }
    }
}

#[async_trait]
impl TaskExecutor for CreatePrExecutor {
    async fn execute(&self, task: &Task) -> Result<TaskResult, ValidationError> {
        let command = match task.payload.command.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit.to_string(),
            _ => create_pr_command(&task.payload)?,
        };
        run_shell(&command, &task.payload, self.timeout, self.max_capture).await
    }
}

/// Builds the `gh pr create` invocation from `params.title`, `params.body`
/// and `params.base`. Without a title, `--fill` takes title and body from
/// the commits.
pub fn create_pr_command(payload: &TaskPayload) -> Result<String, ValidationError> {
    let mut command = String::from("gh pr create");

    let title = string_param(payload, "title")?;
    let body = string_param(payload, "body")?;
    let base = string_param(payload, "base")?;

    match title {
        Some(title) => {
            command.push_str(" --title ");
            command.push_str(&shell_quote(title));
            command.push_str(" --body ");
            command.push_str(&shell_quote(body.unwrap_or("")));
        }
        None => command.push_str(" --fill"),
    }

    if let Some(base) = base {
        command.push_str(" --base ");
        command.push_str(&shell_quote(base));
    }

    Ok(command)
}

/// Quotes a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Reads an optional string parameter; present but not a string is invalid.
fn string_param<'a>(
    payload: &'a TaskPayload,
    name: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match payload.params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::InvalidParam {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        }),
    }
}

/// Environment exposed to every spawned command.
pub(super) fn task_env(payload: &TaskPayload) -> Vec<(String, String)> {
    vec![
        (
            "DISPATCH_WORKFLOW_ID".to_string(),
            payload.workflow_id.to_string(),
        ),
        ("DISPATCH_RUN_ID".to_string(), payload.run_id.clone()),
        ("DISPATCH_STEP_ID".to_string(), payload.step_id.to_string()),
    ]
}

/// Working directory from `params.cwd`.
pub(super) fn task_cwd(payload: &TaskPayload) -> Result<Option<PathBuf>, ValidationError> {
    Ok(string_param(payload, "cwd")?.map(PathBuf::from))
}

#[instrument(skip(payload, timeout, max_capture), fields(workflow_id = %payload.workflow_id, step_id = %payload.step_id))]
async fn run_shell(
    command: &str,
    payload: &TaskPayload,
    timeout: Duration,
    max_capture: usize,
) -> Result<TaskResult, ValidationError> {
    let mut spec = ProcessSpec::shell(command, timeout, max_capture);
    spec.cwd = task_cwd(payload)?;
    spec.envs = task_env(payload);

    let result = process::run(&spec).await.into_task_result(&spec);
    info!(success = result.is_success(), "Command finished");
    Ok(result)
}
