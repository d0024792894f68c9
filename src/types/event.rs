//! Inbound "step completed" events.

use serde::{Deserialize, Serialize};

use super::ids::{IdempotencyKey, StepId, WorkflowId};

/// The only event type the dispatcher acts on.
pub const STOP_EVENT_TYPE: &str = "StopDetected";

/// Timestamp as sent by the emitter: epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    Millis(i64),
    Text(String),
}

/// Signal that a step of a workflow run has finished.
///
/// Immutable once received; identifies exactly one occurrence of a step
/// finishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub workflow_id: WorkflowId,
    pub run_id: String,
    pub step_id: StepId,
    pub stop_token: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub ts: EventTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl StopEvent {
    /// Returns the key used for duplicate suppression.
    ///
    /// An explicit, non-empty `idempotencyKey` wins; otherwise the key is
    /// derived from the workflow and step IDs.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        match self.idempotency_key.as_deref() {
            Some(key) if !key.is_empty() => IdempotencyKey::new(key),
            _ => IdempotencyKey::derived(&self.workflow_id, &self.step_id),
        }
    }
}

/// Reads the `type` field of a raw event body without requiring the rest of
/// the event to be well-formed.
pub fn event_type_of(body: &serde_json::Value) -> Option<&str> {
    body.get("type").and_then(|t| t.as_str())
}
