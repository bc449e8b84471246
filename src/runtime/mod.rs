//! A single worker's scripting engine plus the short-lived execution
//! contexts it multiplexes. Exactly one [`WorkerRuntime`] lives per worker
//! thread for that thread's whole life; nothing here is `Sync`, and nothing
//! here is meant to be — nothing outside the owning thread ever touches it.

mod context;
mod timers;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use rquickjs::{Context as JsContext, Ctx, Function, Opt, Persistent, Runtime as Engine};

pub(crate) use context::ContextId;
use context::ExecutionContext;
pub(crate) use timers::TimerId;
use timers::{DeadlineQueue, TimerMode, TimerRecord, TimerRegistry};

use crate::error::PoolError;
use crate::task::{CompletionCallback, TaskId};

/// Upper bound on microtask-queue drain iterations per loop turn, guarding
/// against a script whose promise chain keeps producing new microtasks
/// forever. Once the cap is hit the remaining jobs are simply left for the
/// next `run_loop_once` call rather than starving timers indefinitely.
const MICROTASK_DRAIN_CAP: usize = 1000;

/// State reachable both from [`WorkerRuntime`] itself and from the native
/// `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval` bindings
/// installed into every context's globals. `Rc`, not `Arc`: never leaves the
/// worker thread that created it.
struct RuntimeHandle {
    contexts: RefCell<Vec<Option<ExecutionContext>>>,
    live_count: Cell<usize>,
    max_contexts: usize,
    timers: TimerRegistry,
    deadlines: DeadlineQueue,
}

impl RuntimeHandle {
    fn arm_timer(
        &self,
        ctx: &Ctx<'_>,
        ctx_id: ContextId,
        callback: Function<'_>,
        mode: TimerMode,
        delay_ms: f64,
    ) -> rquickjs::Result<TimerId> {
        let delay_ms = if delay_ms.is_sign_negative() || delay_ms.is_nan() {
            0.0
        } else {
            delay_ms
        };
        let delay = Duration::from_secs_f64(delay_ms / 1000.0);
        let id = self.timers.allocate_id();
        let callback = Persistent::save(ctx, callback);
        self.timers.insert(TimerRecord {
            id,
            context: ctx_id,
            callback,
            mode,
            delay,
        });
        self.deadlines.push(Instant::now() + delay, id);
        if let Some(Some(slot)) = self.contexts.borrow_mut().get_mut(ctx_id) {
            slot.active_timers += 1;
        }
        Ok(id)
    }

    /// Idempotent: cancelling an id that already fired or was already
    /// cancelled is a silent no-op, matching how the script-visible
    /// `clearTimeout` contract treats stale handles.
    fn disarm_timer(&self, id: TimerId) {
        if let Some(record) = self.timers.remove(id) {
            self.release_timer_slot(record.context);
        }
    }

    fn release_timer_slot(&self, ctx_id: ContextId) {
        if let Some(Some(slot)) = self.contexts.borrow_mut().get_mut(ctx_id) {
            slot.active_timers = slot.active_timers.saturating_sub(1);
        }
    }
}

fn install_timer_bindings(
    handle: Rc<RuntimeHandle>,
    ctx_id: ContextId,
    ctx: &Ctx<'_>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let h = handle.clone();
    globals.set(
        "setTimeout",
        Function::new(ctx.clone(), move |ctx: Ctx<'_>, callback: Function<'_>, delay: Opt<f64>| {
            h.arm_timer(&ctx, ctx_id, callback, TimerMode::OneShot, delay.0.unwrap_or(0.0))
        })?,
    )?;

    let h = handle.clone();
    globals.set(
        "setInterval",
        Function::new(ctx.clone(), move |ctx: Ctx<'_>, callback: Function<'_>, delay: Opt<f64>| {
            h.arm_timer(&ctx, ctx_id, callback, TimerMode::Periodic, delay.0.unwrap_or(0.0))
        })?,
    )?;

    let h = handle.clone();
    globals.set(
        "clearTimeout",
        Function::new(ctx.clone(), move |id: Opt<i32>| {
            if let Some(id) = id.0 {
                h.disarm_timer(id);
            }
        })?,
    )?;

    let h = handle.clone();
    globals.set(
        "clearInterval",
        Function::new(ctx.clone(), move |id: Opt<i32>| {
            if let Some(id) = id.0 {
                h.disarm_timer(id);
            }
        })?,
    )?;

    Ok(())
}

/// One scripting-engine instance plus its live execution contexts. Owned
/// entirely by a single worker thread.
pub struct WorkerRuntime {
    engine: Engine,
    handle: Rc<RuntimeHandle>,
}

impl WorkerRuntime {
    pub fn new(max_contexts: usize, timer_buckets: usize) -> Result<Self, PoolError> {
        let engine = Engine::new()
            .map_err(|_| PoolError::ResourceExhaustion("failed to initialize script engine"))?;
        let handle = Rc::new(RuntimeHandle {
            contexts: RefCell::new(Vec::new()),
            live_count: Cell::new(0),
            max_contexts,
            timers: TimerRegistry::with_bucket_count(timer_buckets),
            deadlines: DeadlineQueue::new(),
        });
        Ok(Self { engine, handle })
    }

    pub fn live_context_count(&self) -> usize {
        self.handle.live_count.get()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.handle.deadlines.next_deadline()
    }

    fn context_handle(&self, ctx_id: ContextId) -> Option<JsContext> {
        self.handle
            .contexts
            .borrow()
            .get(ctx_id)
            .and_then(|s| s.as_ref())
            .map(|s| s.ctx.clone())
    }

    fn new_context(
        &mut self,
        task_id: TaskId,
        on_complete: CompletionCallback,
    ) -> Result<ContextId, PoolError> {
        if self.handle.live_count.get() >= self.handle.max_contexts {
            return Err(PoolError::RuntimeCapacity);
        }
        let ctx = JsContext::full(&self.engine)
            .map_err(|_| PoolError::ResourceExhaustion("failed to create script context"))?;
        let ctx_id = {
            let mut contexts = self.handle.contexts.borrow_mut();
            let slot = ExecutionContext::new(ctx.clone(), task_id, on_complete);
            match contexts.iter().position(Option::is_none) {
                Some(idx) => {
                    contexts[idx] = Some(slot);
                    idx
                }
                None => {
                    contexts.push(Some(slot));
                    contexts.len() - 1
                }
            }
        };
        self.handle.live_count.set(self.handle.live_count.get() + 1);
        ctx.with(|js_ctx| install_timer_bindings(self.handle.clone(), ctx_id, &js_ctx))
            .map_err(|e| PoolError::ScriptError(format!("failed to install timer bindings: {e}")))?;
        Ok(ctx_id)
    }

    /// Evaluates script source to completion, draining microtasks once
    /// before returning. Timers armed during evaluation keep the context
    /// alive until they fire or are cancelled.
    pub fn eval_source(
        &mut self,
        task_id: TaskId,
        source: &[u8],
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError> {
        let ctx_id = self.new_context(task_id, on_complete)?;
        let ctx = self.context_handle(ctx_id).expect("context just created");
        let outcome: rquickjs::Result<()> =
            ctx.with(|ctx| ctx.eval::<rquickjs::Value, _>(source).map(|_| ()));
        self.drain_microtasks();
        let result = outcome.map_err(|err| PoolError::ScriptError(err.to_string()));
        if let Err(err) = &result {
            warn!("{task_id} failed: {err}");
        }
        self.request_context_free(ctx_id);
        result
    }

    /// Evaluates a pre-compiled bytecode module. `bytecode` must have been
    /// produced by this same engine's serializer; rquickjs does not
    /// validate foreign blobs, it trusts them.
    pub fn eval_bytecode(
        &mut self,
        task_id: TaskId,
        bytecode: &[u8],
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError> {
        if bytecode.is_empty() {
            return Err(PoolError::SubmissionRefused("bytecode payload is empty"));
        }
        let ctx_id = self.new_context(task_id, on_complete)?;
        let ctx = self.context_handle(ctx_id).expect("context just created");
        let outcome: rquickjs::Result<()> = ctx.with(|ctx| {
            // SAFETY: caller contract requires `bytecode` to have come from
            // this engine's own bytecode serializer; rquickjs does not
            // validate the blob's provenance itself.
            let module = unsafe { rquickjs::Module::load(ctx.clone(), bytecode)? };
            let (_module, promise) = module.eval()?;
            promise.finish::<()>()
        });
        self.drain_microtasks();
        let result = outcome.map_err(|err| PoolError::ScriptError(err.to_string()));
        if let Err(err) = &result {
            warn!("{task_id} failed: {err}");
        }
        self.request_context_free(ctx_id);
        result
    }

    fn drain_microtasks(&mut self) {
        for _ in 0..MICROTASK_DRAIN_CAP {
            match self.engine.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return,
                Err(err) => {
                    warn!("microtask raised an exception: {err}");
                    return;
                }
            }
        }
        warn!(
            "microtask drain hit the {MICROTASK_DRAIN_CAP}-iteration cap; remaining jobs deferred \
             to the next loop turn"
        );
    }

    /// Fires every timer whose deadline has passed, draining microtasks
    /// after each one, then returns the number of timers still outstanding
    /// across the whole runtime.
    pub fn run_loop_once(&mut self) -> usize {
        let now = Instant::now();
        while let Some((_, id)) = self.handle.deadlines.pop_due(now) {
            let Some(record) = self.handle.timers.remove(id) else {
                continue; // stale heap entry: already cancelled or re-fired
            };
            self.fire(record);
            self.drain_microtasks();
        }
        self.handle.timers.len()
    }

    pub fn run_loop(&mut self) {
        while self.run_loop_once() > 0 {}
    }

    fn fire(&mut self, record: TimerRecord) {
        let TimerRecord {
            id,
            context,
            callback,
            mode,
            delay,
        } = record;
        match self.invoke(context, callback) {
            Some(persistent) if mode == TimerMode::Periodic => {
                self.handle.timers.insert(TimerRecord {
                    id,
                    context,
                    callback: persistent,
                    mode,
                    delay,
                });
                self.handle.deadlines.push(Instant::now() + delay, id);
            }
            _ => {
                self.handle.release_timer_slot(context);
                self.maybe_free_context(context);
            }
        }
    }

    /// Calls `callback` in its owning context and, if the call itself
    /// didn't fail to restore, hands back a fresh `Persistent` so periodic
    /// timers can keep using the same function value next period.
    fn invoke(
        &mut self,
        ctx_id: ContextId,
        callback: Persistent<Function<'static>>,
    ) -> Option<Persistent<Function<'static>>> {
        let js_ctx = self.context_handle(ctx_id)?;
        js_ctx.with(|ctx| {
            let function = match callback.restore(&ctx) {
                Ok(f) => f,
                Err(err) => {
                    warn!("failed to restore timer callback: {err}");
                    return None;
                }
            };
            if let Err(err) = function.call::<_, rquickjs::Value>(()) {
                warn!("timer callback raised an exception: {err}");
            }
            Some(Persistent::save(&ctx, function))
        })
    }

    fn request_context_free(&mut self, ctx_id: ContextId) {
        if let Some(Some(slot)) = self.handle.contexts.borrow_mut().get_mut(ctx_id) {
            slot.pending_free = true;
        }
        self.maybe_free_context(ctx_id);
    }

    fn maybe_free_context(&mut self, ctx_id: ContextId) {
        let reclaimable = matches!(
            self.handle.contexts.borrow().get(ctx_id),
            Some(Some(slot)) if slot.reclaimable()
        );
        if reclaimable {
            self.free_context(ctx_id);
        }
    }

    fn cancel_context_timers(&mut self, ctx_id: ContextId) {
        let removed = self.handle.timers.remove_for_context(ctx_id);
        if !removed.is_empty() {
            trace!("dropped {} outstanding timer(s) during context teardown", removed.len());
        }
        if let Some(Some(slot)) = self.handle.contexts.borrow_mut().get_mut(ctx_id) {
            slot.active_timers = 0;
        }
    }

    fn free_context(&mut self, ctx_id: ContextId) {
        self.cancel_context_timers(ctx_id);
        let slot = self
            .handle
            .contexts
            .borrow_mut()
            .get_mut(ctx_id)
            .and_then(Option::take);
        if let Some(mut slot) = slot {
            self.handle.live_count.set(self.handle.live_count.get().saturating_sub(1));
            if let Some(cb) = slot.on_complete.take() {
                cb(slot.task_id);
            }
        }
    }

    /// Tears down every remaining live context, force-detaching any that
    /// still had outstanding timers. Consumes the runtime: called exactly
    /// once, when the owning worker is shutting down.
    pub fn free_runtime(mut self) {
        let live: Vec<ContextId> = self
            .handle
            .contexts
            .borrow()
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        let leaked = live.len();
        for ctx_id in live {
            if let Some(Some(slot)) = self.handle.contexts.borrow_mut().get_mut(ctx_id) {
                slot.pending_free = true;
            }
            self.free_context(ctx_id);
        }
        if leaked > 0 {
            warn!("{leaked} execution context(s) force-detached during runtime shutdown");
        }
    }
}
