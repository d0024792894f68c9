//! Workflow definitions: the YAML file format and its validated form.
//!
//! # File format
//!
//! ```yaml
//! workflows:
//!   - id: default
//!     name: Default pipeline
//!     steps:
//!       - id: ai_output_complete
//!         next: run_tests
//!       - id: run_tests
//!         command: npm test
//!       - id: review
//!         on: tests_passed
//!         skill: code-review
//!         params: { depth: 2 }
//! ```
//!
//! A bare top-level list of workflows is accepted as well.
//!
//! Each raw step becomes a [`WorkflowStep`] whose trigger is explicit: either
//! it fires on a named step ID (`on`) or it is only reachable through a
//! predecessor's `next` pointer.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use super::WorkflowError;
use crate::types::{StepId, TaskType, WorkflowId};

/// The wrapped top-level form, `workflows: [...]`.
#[derive(Debug, Deserialize)]
struct WrappedFile {
    workflows: Vec<RawWorkflow>,
}

/// Parses either accepted top-level form.
///
/// The shape is decided up front rather than by trying each form in turn, so
/// a mistake inside a step is reported with its field name and position.
pub(crate) fn parse_workflow_file(yaml: &str) -> Result<Vec<RawWorkflow>, serde_yaml::Error> {
    if serde_yaml::from_str::<serde_yaml::Value>(yaml)?.is_sequence() {
        serde_yaml::from_str(yaml)
    } else {
        serde_yaml::from_str::<WrappedFile>(yaml).map(|file| file.workflows)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawWorkflow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawStep {
    id: String,
    #[serde(default)]
    on: Option<String>,
    #[serde(default)]
    task: Option<TaskType>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    skill: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    next: Option<String>,
}

/// How a step is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTrigger {
    /// Fires when an event reports this step ID as completed.
    On(StepId),
    /// Fires only when a predecessor's `next` points here.
    Chained,
}

/// What a step runs when it fires.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAction {
    pub task_type: TaskType,
    pub command: Option<String>,
    pub skill: Option<String>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StepAction {
    /// Picks the task type for a step: an explicit `task` wins, then `skill`,
    /// then `command`; a step with none of these is a no-op.
    fn from_raw(
        task: Option<TaskType>,
        command: Option<String>,
        skill: Option<String>,
        params: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Self {
        let task_type = match (task, &skill, &command) {
            (Some(explicit), _, _) => explicit,
            (None, Some(_), _) => TaskType::RunSkill,
            (None, None, Some(_)) => TaskType::Shell,
            (None, None, None) => TaskType::Noop,
        };

        StepAction {
            task_type,
            command,
            skill,
            params: params.unwrap_or_default(),
        }
    }
}

/// A validated step.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub id: StepId,
    pub trigger: StepTrigger,
    pub action: StepAction,
    pub next: Option<StepId>,
}

/// A validated, immutable workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    steps: Vec<WorkflowStep>,
    /// Step index by step ID.
    by_id: HashMap<StepId, usize>,
    /// Step index by `on` trigger.
    by_trigger: HashMap<StepId, usize>,
}

impl WorkflowDefinition {
    /// Returns the steps in file order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    /// Looks up a step by its ID.
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.by_id.get(id).map(|&i| &self.steps[i])
    }

    /// Looks up the step triggered by the given completed step ID.
    pub fn triggered_by(&self, completed: &StepId) -> Option<&WorkflowStep> {
        self.by_trigger.get(completed).map(|&i| &self.steps[i])
    }

    /// Validates a raw workflow.
    pub(crate) fn from_raw(raw: RawWorkflow) -> Result<Self, WorkflowError> {
        validate_id(&raw.id).map_err(|reason| WorkflowError::InvalidWorkflowId {
            id: raw.id.clone(),
            reason,
        })?;
        let workflow_id = WorkflowId::new(&raw.id);

        if raw.steps.is_empty() {
            return Err(WorkflowError::NoSteps(workflow_id));
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        let mut by_id = HashMap::new();
        let mut by_trigger = HashMap::new();

        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            validate_id(&raw_step.id).map_err(|reason| WorkflowError::InvalidStepId {
                workflow: workflow_id.clone(),
                id: raw_step.id.clone(),
                reason,
            })?;
            let step_id = StepId::new(&raw_step.id);

            if by_id.insert(step_id.clone(), index).is_some() {
                return Err(WorkflowError::DuplicateStep {
                    workflow: workflow_id.clone(),
                    step: step_id,
                });
            }

            let trigger = match raw_step.on {
                Some(on) if !on.is_empty() => {
                    let on = StepId::new(on);
                    if by_trigger.insert(on.clone(), index).is_some() {
                        return Err(WorkflowError::DuplicateTrigger {
                            workflow: workflow_id.clone(),
                            on,
                        });
                    }
                    StepTrigger::On(on)
                }
                _ => StepTrigger::Chained,
            };

            steps.push(WorkflowStep {
                id: step_id,
                trigger,
                action: StepAction::from_raw(
                    raw_step.task,
                    raw_step.command,
                    raw_step.skill,
                    raw_step.params,
                ),
                next: raw_step.next.filter(|n| !n.is_empty()).map(StepId::new),
            });
        }

        for step in &steps {
            if let Some(next) = &step.next
                && !by_id.contains_key(next)
            {
                return Err(WorkflowError::UnknownNext {
                    workflow: workflow_id.clone(),
                    step: step.id.clone(),
                    next: next.clone(),
                });
            }
        }

        if let Some(step) = find_cycle(&steps, &by_id) {
            return Err(WorkflowError::Cycle {
                workflow: workflow_id,
                step,
            });
        }

        Ok(WorkflowDefinition {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: workflow_id,
            description: raw.description,
            steps,
            by_id,
            by_trigger,
        })
    }
}

/// Rejects IDs that are empty or unsafe to embed in job IDs and file names.
fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.trim().is_empty() {
        return Err("must not be empty");
    }
    if id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err("must not contain path separators or NUL");
    }
    if id.starts_with('.') {
        return Err("must not start with '.'");
    }
    Ok(())
}

/// Follows `next` pointers from every step and returns a step that lies on a
/// cycle, if any.
///
/// Each step has at most one successor, so a walk that revisits a step it has
/// already passed has found a cycle.
fn find_cycle(steps: &[WorkflowStep], by_id: &HashMap<StepId, usize>) -> Option<StepId> {
    let mut acyclic: HashSet<usize> = HashSet::new();

    for start in 0..steps.len() {
        let mut path: HashSet<usize> = HashSet::new();
        let mut current = Some(start);

        while let Some(index) = current {
            if acyclic.contains(&index) {
                break;
            }
            if !path.insert(index) {
                return Some(steps[index].id.clone());
            }
            current = steps[index]
                .next
                .as_ref()
                .and_then(|next| by_id.get(next).copied());
        }

        acyclic.extend(path);
    }

    None
}
