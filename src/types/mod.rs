//! Core domain types for the workflow dispatcher.
//!
//! Identifiers, inbound events and tasks. Everything here is plain data that
//! crosses module boundaries.

pub mod event;
pub mod ids;
pub mod task;

pub use event::{EventTimestamp, STOP_EVENT_TYPE, StopEvent, event_type_of};
pub use ids::{IdempotencyKey, JobId, StepId, WorkflowId};
pub use task::{Task, TaskPayload, TaskType};
