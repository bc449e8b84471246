use std::fmt;

/// Failure kinds surfaced across the pool boundary.
///
/// Script and timer-callback failures (`ScriptError`, `TimerCallbackError`)
/// never reach this type in practice outside of logging: per the pool's
/// error-propagation contract they are swallowed at the point they occur and
/// do not abort the worker or the pool. The variants exist so the same enum
/// can describe what got logged as well as what gets returned.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Submission was rejected: null/empty payload, a full bounded queue
    /// after its wait elapsed, or an allocation failure.
    #[error("submission refused: {0}")]
    SubmissionRefused(&'static str),

    /// A worker's runtime had reached `max_contexts_per_runtime` live
    /// contexts when a new job arrived.
    #[error("worker runtime at capacity")]
    RuntimeCapacity,

    /// The evaluated script threw or failed to compile/load.
    #[error("script error: {0}")]
    ScriptError(String),

    /// An exception escaped a fired timer callback.
    #[error("timer callback error: {0}")]
    TimerCallbackError(String),

    /// An allocation or other resource request failed inside the pool.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),

    /// The event loop's handle-close walk found residual handles at
    /// shutdown. Logged and tolerated, never fatal.
    #[error("shutdown leak: {0} handle(s) still attached")]
    ShutdownLeak(usize),

    /// `resize_pool`/`thread_stats` referenced a thread id that doesn't
    /// exist in the current pool.
    #[error("no such worker thread: {0}")]
    NoSuchThread(usize),

    /// The pool has already begun shutting down.
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Result of [`crate::Pool::wait_for_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The requested timeout elapsed before the pool went quiescent.
    Timeout,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for pool to go idle"),
        }
    }
}

impl std::error::Error for WaitError {}
