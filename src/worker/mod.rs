//! Task execution.
//!
//! The worker pool is the only consumer of the task queue. Intake never waits
//! on it: the queue is the boundary between accepting an event and running
//! the work it implies.

mod pool;

pub use pool::{DEFAULT_CONCURRENCY, WorkerPool, WorkerPoolHandle};
