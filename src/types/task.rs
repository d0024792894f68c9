//! Tasks: the unit of work handed from the workflow graph to the executors.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{StepId, WorkflowId};

/// The kind of work a task performs. Each type maps to exactly one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Shell,
    RunTests,
    Build,
    CreatePr,
    RunSkill,
    Noop,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 6] = [
        TaskType::Shell,
        TaskType::RunTests,
        TaskType::Build,
        TaskType::CreatePr,
        TaskType::RunSkill,
        TaskType::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Shell => "shell",
            TaskType::RunTests => "run_tests",
            TaskType::Build => "build",
            TaskType::CreatePr => "create_pr",
            TaskType::RunSkill => "run_skill",
            TaskType::Noop => "noop",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an executor needs to run a task, plus the context needed to
/// correlate its result with the originating workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub workflow_id: WorkflowId,
    pub run_id: String,
    /// The step whose action this task carries out.
    pub step_id: StepId,
    /// The step ID reported by the event that triggered this task.
    pub trigger_step_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl TaskPayload {
    /// Returns a string parameter, if present.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }
}

/// A resolved unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: TaskPayload,
}
