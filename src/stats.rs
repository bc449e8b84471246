use std::time::Duration;

/// Snapshot returned by [`crate::Pool::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub active_threads: usize,
    pub idle_threads: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub thread_utilization_pct: f64,
    pub avg_execution_time: Duration,
}

/// Snapshot returned by [`crate::Pool::thread_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    pub thread_id: usize,
    pub tasks_processed: u64,
    pub idle_time_ms: u64,
    pub busy_time_ms: u64,
}
