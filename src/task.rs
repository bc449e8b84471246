use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Identifies a submitted [`Task`] for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The body a [`Task`] carries: either source text or a pre-compiled
/// bytecode blob. Owned copies, per spec I5 — the submitter's buffer is
/// duplicated at submission time and handed to the engine exactly once.
#[derive(Debug)]
pub enum Payload {
    Source(Vec<u8>),
    Bytecode(Vec<u8>),
}

impl Payload {
    pub(crate) fn len(&self) -> usize {
        match self {
            Payload::Source(b) | Payload::Bytecode(b) => b.len(),
        }
    }
}

/// Invoked exactly once per submitted [`Task`], after its execution context
/// has been fully torn down (see `runtime::context::ExecutionContext`). The
/// callback is a plain `FnOnce` closure — in idiomatic Rust this subsumes
/// the "callback + opaque argument" pairing the wire-level spec calls for,
/// since whatever the caller would have stuffed into the opaque argument is
/// simply captured by the closure.
pub type CompletionCallback = Box<dyn FnOnce(TaskId) + Send + 'static>;

/// A unit of submitted work: a script body, a completion callback, and the
/// bookkeeping the pool needs to report `avg_execution_time`.
pub struct Task {
    pub id: TaskId,
    pub payload: Payload,
    pub on_complete: Option<CompletionCallback>,
    pub submitted_at: Instant,
    pub started_at: Option<Instant>,
}

impl Task {
    pub fn new(payload: Payload, on_complete: CompletionCallback) -> Self {
        Self {
            id: TaskId::next(),
            payload,
            on_complete: Some(on_complete),
            submitted_at: Instant::now(),
            started_at: None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}
