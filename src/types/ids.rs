//! Newtype wrappers for dispatcher identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., passing a
//! step ID where a workflow ID is expected) and make signatures self-documenting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::task::TaskType;

/// Identifier of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(s: impl Into<String>) -> Self {
        WorkflowId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        WorkflowId(s.to_string())
    }
}

/// Identifier of a step within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(s: impl Into<String>) -> Self {
        StepId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

/// Key that identifies one logical event for duplicate suppression.
///
/// Either supplied by the sender (`idempotencyKey`) or derived from
/// `<workflowId>:<stepId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(s: impl Into<String>) -> Self {
        IdempotencyKey(s.into())
    }

    /// Fallback key used when the event carries none.
    pub fn derived(workflow: &WorkflowId, step: &StepId) -> Self {
        IdempotencyKey(format!("{}:{}", workflow.as_str(), step.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        IdempotencyKey(s)
    }
}

/// Number of hex characters of the key digest embedded in a job ID.
const JOB_ID_DIGEST_LEN: usize = 16;

/// Identifier of a queued job.
///
/// Format: `<workflowId>:<taskType>:<digest>` where the digest is derived from
/// the idempotency key. Two submissions for the same logical event therefore
/// produce the same job ID, while distinct events arriving in the same instant
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(s: impl Into<String>) -> Self {
        JobId(s.into())
    }

    /// Builds the deterministic job ID for a task spawned by an event.
    pub fn for_event(workflow: &WorkflowId, task_type: TaskType, key: &IdempotencyKey) -> Self {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        JobId(format!(
            "{}:{}:{}",
            workflow.as_str(),
            task_type.as_str(),
            &digest[..JOB_ID_DIGEST_LEN]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}
