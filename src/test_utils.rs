//! Shared test fixtures.

use serde_json::json;

use crate::types::{
    EventTimestamp, STOP_EVENT_TYPE, StepId, StopEvent, Task, TaskPayload, TaskType, WorkflowId,
};
use crate::webhooks::signature::{compute_signature, format_signature_header};

pub const TEST_SECRET: &[u8] = b"test-secret";

pub fn stop_event(workflow: &str, step: &str, key: &str) -> StopEvent {
    StopEvent {
        event_type: STOP_EVENT_TYPE.to_string(),
        workflow_id: WorkflowId::from(workflow),
        run_id: "run-1".to_string(),
        step_id: StepId::from(step),
        stop_token: "stop-token".to_string(),
        source: "test".to_string(),
        files: Vec::new(),
        meta: None,
        ts: EventTimestamp::Millis(1_700_000_000_000),
        idempotency_key: Some(key.to_string()),
    }
}

/// Wire form of a stop event.
pub fn stop_event_json(workflow: &str, step: &str, key: &str) -> serde_json::Value {
    json!({
        "type": STOP_EVENT_TYPE,
        "workflowId": workflow,
        "runId": "run-1",
        "stepId": step,
        "stopToken": "stop-token",
        "source": "test",
        "ts": 1_700_000_000_000i64,
        "idempotencyKey": key,
    })
}

/// Signature header value for `body` under [`TEST_SECRET`].
pub fn sign(body: &[u8]) -> String {
    format_signature_header(&compute_signature(body, TEST_SECRET))
}

fn task(task_type: TaskType) -> Task {
    Task {
        task_type,
        payload: TaskPayload {
            workflow_id: WorkflowId::from("wf-test"),
            run_id: "run-1".to_string(),
            step_id: StepId::from("step"),
            trigger_step_id: StepId::from("prev"),
            command: None,
            skill: None,
            params: serde_json::Map::new(),
            files: Vec::new(),
            meta: None,
        },
    }
}

pub fn noop_task() -> Task {
    task(TaskType::Noop)
}

pub fn shell_task(command: &str) -> Task {
    let mut task = task(TaskType::Shell);
    task.payload.command = Some(command.to_string());
    task
}

pub fn skill_task(skill: &str) -> Task {
    let mut task = task(TaskType::RunSkill);
    task.payload.skill = Some(skill.to_string());
    task
}
