//! Workflow Dispatcher - turns signed "step completed" events into bounded,
//! concurrent task execution.
//!
//! Pipeline: signature check, idempotency guard, workflow graph resolution,
//! durable task queue, worker pool, command executors.

pub mod config;
pub mod dedupe;
pub mod executor;
pub mod queue;
pub mod server;
pub mod types;
pub mod webhooks;
pub mod worker;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_utils;
