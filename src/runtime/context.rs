use rquickjs::Context;

use crate::task::{CompletionCallback, TaskId};

/// Index into a [`super::WorkerRuntime`]'s live-context table. Cheap,
/// `Copy`, and meaningless outside the runtime that issued it.
pub type ContextId = usize;

/// A short-lived, per-task isolate within a [`super::WorkerRuntime`].
///
/// Reclaimed exactly when `pending_free && active_timers == 0` (spec I3).
/// `active_timers` is maintained solely by the timer bindings and the fire
/// algorithm in `super::timers`; nothing else increments or decrements it.
pub struct ExecutionContext {
    pub(super) ctx: Context,
    pub(super) task_id: TaskId,
    pub(super) on_complete: Option<CompletionCallback>,
    pub(super) active_timers: usize,
    pub(super) pending_free: bool,
}

impl ExecutionContext {
    pub(super) fn new(ctx: Context, task_id: TaskId, on_complete: CompletionCallback) -> Self {
        Self {
            ctx,
            task_id,
            on_complete: Some(on_complete),
            active_timers: 0,
            pending_free: false,
        }
    }

    /// True once the context has no reason to stay alive: the evaluating
    /// call has returned and every timer it armed has fired or been
    /// cancelled.
    pub(super) fn reclaimable(&self) -> bool {
        self.pending_free && self.active_timers == 0
    }
}
