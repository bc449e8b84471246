//! An embedded, multi-threaded execution pool for short-lived scripted
//! jobs: a bounded global task queue feeding a fixed-or-elastic set of
//! worker threads, each multiplexing many short-lived script execution
//! contexts through its own engine instance and timer registry.
//!
//! Host applications embed [`Pool`] directly; the pool owns its threads,
//! its scripting engines, and every timer armed by the scripts it runs.
//! Logging goes through the [`log`] facade — plug in whatever backend the
//! host already uses.

mod error;
mod pool;
mod queue;
mod runtime;
mod stats;
mod task;

pub use error::{PoolError, WaitError};
pub use pool::{Pool, PoolConfig};
pub use stats::{PoolStats, ThreadStats};
pub use task::{CompletionCallback, Payload, TaskId};
