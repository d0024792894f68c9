//! Workflow graph: decides which task, if any, an incoming event triggers.
//!
//! Definitions are loaded once at startup and never change afterwards, so the
//! graph is shared read-only behind an `Arc` with no locking.
//!
//! # Resolution
//!
//! For an event `(workflowId, stepId)`:
//!
//! 1. Pick the workflow whose ID matches, else the fallback workflow.
//! 2. A step with `on: <stepId>` fires.
//! 3. Otherwise the step with `id: <stepId>` advances along its `next`
//!    pointer and the successor fires.
//! 4. Otherwise nothing happens. This is not an error.

mod definition;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use definition::{StepAction, StepTrigger, WorkflowDefinition, WorkflowStep};

use crate::types::{StepId, StopEvent, Task, TaskPayload, WorkflowId};
use definition::parse_workflow_file;

/// ID of the workflow used when an event names an unknown workflow.
pub const FALLBACK_WORKFLOW_ID: &str = "default";

/// Built-in workflow used when no definition file exists.
const BUILTIN_WORKFLOWS: &str = r#"
workflows:
  - id: default
    name: Default pipeline
    description: Test, build and open a pull request after the agent finishes.
    steps:
      - id: ai_output_complete
        next: run_tests
      - id: run_tests
        command: npm test
        next: build
      - id: build
        command: npm run build
        next: create_pr
      - id: create_pr
        task: create_pr
"#;

/// Errors raised while loading workflow definitions. All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workflow yaml in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no workflows defined")]
    Empty,

    #[error("invalid workflow id {id:?}: {reason}")]
    InvalidWorkflowId { id: String, reason: &'static str },

    #[error("workflow {workflow}: invalid step id {id:?}: {reason}")]
    InvalidStepId {
        workflow: WorkflowId,
        id: String,
        reason: &'static str,
    },

    #[error("duplicate workflow id: {0}")]
    DuplicateWorkflow(WorkflowId),

    #[error("workflow {0} has no steps")]
    NoSteps(WorkflowId),

    #[error("workflow {workflow}: duplicate step id {step}")]
    DuplicateStep { workflow: WorkflowId, step: StepId },

    #[error("workflow {workflow}: more than one step triggers on {on}")]
    DuplicateTrigger { workflow: WorkflowId, on: StepId },

    #[error("workflow {workflow}: step {step} points to unknown next step {next}")]
    UnknownNext {
        workflow: WorkflowId,
        step: StepId,
        next: StepId,
    },

    #[error("workflow {workflow}: next pointers form a cycle through step {step}")]
    Cycle { workflow: WorkflowId, step: StepId },
}

/// Result type for workflow loading.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// How an event maps onto a workflow's steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    /// A step triggered directly by the completed step ID.
    Triggered(&'a WorkflowStep),
    /// The completed step's successor.
    Chained {
        from: &'a WorkflowStep,
        to: &'a WorkflowStep,
    },
    /// Nothing to run.
    Unmatched,
}

impl<'a> Resolution<'a> {
    /// The step that should run, if any.
    pub fn step(&self) -> Option<&'a WorkflowStep> {
        match *self {
            Resolution::Triggered(step) => Some(step),
            Resolution::Chained { to, .. } => Some(to),
            Resolution::Unmatched => None,
        }
    }
}

/// The set of loaded workflow definitions.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflows: HashMap<WorkflowId, WorkflowDefinition>,
    fallback: Option<WorkflowId>,
}

impl WorkflowGraph {
    /// Builds a graph from validated definitions.
    ///
    /// The fallback workflow is the one with ID `default`, or the only
    /// workflow if exactly one is loaded.
    pub fn new(definitions: Vec<WorkflowDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut workflows = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            let id = definition.id.clone();
            if workflows.insert(id.clone(), definition).is_some() {
                return Err(WorkflowError::DuplicateWorkflow(id));
            }
        }

        let default_id = WorkflowId::from(FALLBACK_WORKFLOW_ID);
        let fallback = if workflows.contains_key(&default_id) {
            Some(default_id)
        } else if workflows.len() == 1 {
            workflows.keys().next().cloned()
        } else {
            None
        };

        Ok(WorkflowGraph {
            workflows,
            fallback,
        })
    }

    /// Parses and validates workflow definitions from YAML text.
    pub fn from_yaml(yaml: &str, origin: &Path) -> Result<Self> {
        let raw = parse_workflow_file(yaml).map_err(|source| WorkflowError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let definitions = raw
            .into_iter()
            .map(WorkflowDefinition::from_raw)
            .collect::<Result<Vec<_>>>()?;

        Self::new(definitions)
    }

    /// The built-in default workflow.
    pub fn builtin() -> Self {
        Self::from_yaml(BUILTIN_WORKFLOWS, Path::new("<builtin>"))
            .expect("built-in workflow definition is valid")
    }

    /// Loads workflows from a file.
    ///
    /// A missing file falls back to the built-in workflow. A file that exists
    /// but cannot be read or validated is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = match std::fs::read_to_string(path) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %path.display(),
                    "Workflow file not found, using built-in default workflow"
                );
                return Ok(Self::builtin());
            }
            Err(source) => {
                return Err(WorkflowError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let graph = Self::from_yaml(&yaml, path)?;
        info!(
            path = %path.display(),
            workflows = graph.workflows.len(),
            fallback = ?graph.fallback.as_ref().map(WorkflowId::as_str),
            "Loaded workflow definitions"
        );
        Ok(graph)
    }

    /// Number of loaded workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Returns `true` if no workflows are loaded. Never true for a graph built
    /// through [`WorkflowGraph::new`].
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Looks up a workflow by ID.
    pub fn workflow(&self, id: &WorkflowId) -> Option<&WorkflowDefinition> {
        self.workflows.get(id)
    }

    /// The workflow events for `id` are resolved against.
    pub fn select(&self, id: &WorkflowId) -> Option<&WorkflowDefinition> {
        self.workflows
            .get(id)
            .or_else(|| self.fallback.as_ref().and_then(|f| self.workflows.get(f)))
    }

    /// Resolves a completed step against a workflow.
    pub fn resolve<'a>(
        &self,
        workflow: &'a WorkflowDefinition,
        completed: &StepId,
    ) -> Resolution<'a> {
        if let Some(step) = workflow.triggered_by(completed) {
            return Resolution::Triggered(step);
        }

        match workflow.step(completed) {
            Some(from) => match from.next.as_ref().and_then(|next| workflow.step(next)) {
                Some(to) => Resolution::Chained { from, to },
                None => Resolution::Unmatched,
            },
            None => Resolution::Unmatched,
        }
    }

    /// Decides the task an event triggers, or `None` if there is nothing to do.
    pub fn decide_next_task(&self, event: &StopEvent) -> Option<(WorkflowId, Task)> {
        let Some(workflow) = self.select(&event.workflow_id) else {
            debug!(workflow_id = %event.workflow_id, "No workflow matches event");
            return None;
        };

        let resolution = self.resolve(workflow, &event.step_id);
        let step = resolution.step()?;

        debug!(
            workflow = %workflow.id,
            completed = %event.step_id,
            next = %step.id,
            task_type = %step.action.task_type,
            "Resolved next step"
        );

        let task = Task {
            task_type: step.action.task_type,
            payload: TaskPayload {
                workflow_id: event.workflow_id.clone(),
                run_id: event.run_id.clone(),
                step_id: step.id.clone(),
                trigger_step_id: event.step_id.clone(),
                command: step.action.command.clone(),
                skill: step.action.skill.clone(),
                params: step.action.params.clone(),
                files: event.files.clone(),
                meta: event.meta.clone(),
            },
        };

        Some((workflow.id.clone(), task))
    }
}
