//! The worker pool: a global task queue, one runtime-owning thread per
//! worker, work-stealing between their local queues, and a damped
//! background thread that grows or shrinks the pool to match load.

use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::error::{PoolError, WaitError};
use crate::queue::{EnqueueOutcome, TaskQueue};
use crate::runtime::WorkerRuntime;
use crate::stats::{PoolStats, ThreadStats};
use crate::task::{CompletionCallback, Payload, Task, TaskId};

/// Tunables for a [`Pool`]. `Default` picks sane values off the host's
/// reported parallelism; callers needing deterministic behavior in tests
/// should build one explicitly.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub initial_threads: usize,
    pub global_queue_capacity: usize,
    pub local_queue_capacity: usize,
    pub max_contexts_per_runtime: usize,
    pub timer_buckets: usize,
    /// How often the adjuster thread re-evaluates pool size. The spec's
    /// damping window: resizing any faster than this thrashes under bursty
    /// load.
    pub resize_check_interval: Duration,
    /// Scale up when the global queue holds more than this many tasks.
    pub scale_up_queue_threshold: usize,
    /// Whether idle workers are allowed to steal from a peer's local queue.
    /// Disabling this gives a host a predictable, affinity-only pool.
    pub enable_work_stealing: bool,
    /// Whether the background adjuster thread is allowed to grow or shrink
    /// the pool at all. Disabling this pins the pool at `initial_threads`.
    pub dynamic_sizing: bool,
    /// The adjuster only retires a worker when more than this many threads
    /// are simultaneously idle; keeps a buffer of spare idle capacity around
    /// instead of shrinking to the bone the instant the queue drains.
    pub idle_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            min_threads: 1,
            max_threads: cpus * 2,
            initial_threads: cpus,
            global_queue_capacity: 1024,
            local_queue_capacity: 256,
            max_contexts_per_runtime: 64,
            timer_buckets: 64,
            resize_check_interval: Duration::from_secs(1),
            scale_up_queue_threshold: 32,
            enable_work_stealing: true,
            dynamic_sizing: true,
            idle_threshold: 1,
        }
    }
}

struct PoolShared {
    global_queue: TaskQueue,
    completed: AtomicU64,
    exec_ns_total: AtomicU64,
    /// Tasks that have left a queue but whose completion callback has not
    /// yet fired — covers dequeue-in-progress and timer-deferred
    /// completions alike, so quiescence can't be observed prematurely.
    in_flight: AtomicU64,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

struct ThreadData {
    id: usize,
    local_queue: Arc<TaskQueue>,
    should_run: AtomicBool,
    busy: AtomicBool,
    tasks_processed: AtomicU64,
    busy_time_ns: AtomicU64,
    idle_time_ns: AtomicU64,
    last_transition: Mutex<Instant>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn spawn_worker(
    id: usize,
    shared: Arc<PoolShared>,
    pool_mutex: Arc<Mutex<Vec<Arc<ThreadData>>>>,
    shutting_down: Arc<AtomicBool>,
    config: PoolConfig,
) -> Arc<ThreadData> {
    let local_queue = Arc::new(TaskQueue::new(config.local_queue_capacity));
    let data = Arc::new(ThreadData {
        id,
        local_queue,
        should_run: AtomicBool::new(true),
        busy: AtomicBool::new(false),
        tasks_processed: AtomicU64::new(0),
        busy_time_ns: AtomicU64::new(0),
        idle_time_ns: AtomicU64::new(0),
        last_transition: Mutex::new(Instant::now()),
        handle: Mutex::new(None),
    });

    let worker_data = data.clone();
    let handle = thread::Builder::new()
        .name(format!("script-pool-worker-{id}"))
        .spawn(move || worker_main(worker_data, shared, pool_mutex, shutting_down, config))
        .expect("failed to spawn worker thread");
    *data.handle.lock() = Some(handle);
    data
}

fn mark_busy(data: &ThreadData) {
    let mut last = data.last_transition.lock();
    let now = Instant::now();
    data.idle_time_ns
        .fetch_add(now.duration_since(*last).as_nanos() as u64, Ordering::Relaxed);
    *last = now;
    drop(last);
    data.busy.store(true, Ordering::Release);
}

fn mark_idle(data: &ThreadData, shared: &PoolShared) {
    {
        let mut last = data.last_transition.lock();
        let now = Instant::now();
        data.busy_time_ns
            .fetch_add(now.duration_since(*last).as_nanos() as u64, Ordering::Relaxed);
        *last = now;
    }
    data.busy.store(false, Ordering::Release);
    let _guard = shared.idle_lock.lock();
    shared.idle_cv.notify_all();
}

/// Picks a uniformly random starting victim among peers and walks forward
/// from there, skipping `self` and any peer currently flagged idle (an idle
/// peer's local queue is unlikely to hold anything worth the lock attempt).
fn steal_from_peers(self_id: usize, pool_mutex: &Mutex<Vec<Arc<ThreadData>>>) -> Option<Task> {
    let peers = pool_mutex.lock().clone();
    if peers.len() <= 1 {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..peers.len());
    for offset in 0..peers.len() {
        let peer = &peers[(start + offset) % peers.len()];
        if peer.id == self_id || !peer.busy.load(Ordering::Acquire) {
            continue;
        }
        if let Some(task) = peer.local_queue.try_steal_one() {
            return Some(task);
        }
    }
    None
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn execute(runtime: &mut WorkerRuntime, mut task: Task, shared: &Arc<PoolShared>) {
    task.started_at = Some(Instant::now());
    let start = task.started_at.expect("just set");
    let shared = shared.clone();
    let user_cb = task
        .on_complete
        .take()
        .expect("a task always carries its completion callback until executed");
    let wrapped: CompletionCallback = Box::new(move |id| {
        let elapsed = start.elapsed();
        shared.completed.fetch_add(1, Ordering::Relaxed);
        shared
            .exec_ns_total
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        {
            let _guard = shared.idle_lock.lock();
            shared.idle_cv.notify_all();
        }
        user_cb(id);
    });
    let result = match task.payload {
        Payload::Source(src) => runtime.eval_source(task.id, &src, wrapped),
        Payload::Bytecode(bc) => runtime.eval_bytecode(task.id, &bc, wrapped),
    };
    if let Err(err) = result {
        debug!("{} finished with an error: {err}", task.id);
    }
    // Give a freshly-armed zero-delay timer a chance to fire promptly
    // instead of waiting for the queues to drain.
    runtime.run_loop_once();
}

fn worker_main(
    data: Arc<ThreadData>,
    shared: Arc<PoolShared>,
    pool_mutex: Arc<Mutex<Vec<Arc<ThreadData>>>>,
    shutting_down: Arc<AtomicBool>,
    config: PoolConfig,
) {
    let mut runtime = match WorkerRuntime::new(config.max_contexts_per_runtime, config.timer_buckets) {
        Ok(rt) => rt,
        Err(err) => {
            error!("worker {} failed to start its script engine: {err}", data.id);
            return;
        }
    };

    while data.should_run.load(Ordering::Acquire) {
        // Reserved before the dequeue attempt itself, so a concurrent
        // `wait_for_idle` can never observe "queues empty, nothing
        // in-flight" while this worker is mid-dequeue with a task already
        // popped but not yet accounted for.
        shared.in_flight.fetch_add(1, Ordering::AcqRel);

        let task = shared
            .global_queue
            .dequeue()
            .or_else(|| data.local_queue.dequeue())
            .or_else(|| {
                if config.enable_work_stealing {
                    steal_from_peers(data.id, &pool_mutex)
                } else {
                    None
                }
            });

        match task {
            Some(task) => {
                mark_busy(&data);
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| execute(&mut runtime, task, &shared))) {
                    error!("worker {} task panicked: {}", data.id, panic_message(&*panic));
                }
                data.tasks_processed.fetch_add(1, Ordering::Relaxed);
                mark_idle(&data, &shared);
            }
            None => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                {
                    let _guard = shared.idle_lock.lock();
                    shared.idle_cv.notify_all();
                }
                runtime.run_loop_once();
            }
        }

        if shutting_down.load(Ordering::Acquire)
            && data.local_queue.is_empty()
            && shared.global_queue.is_empty()
            && runtime.live_context_count() == 0
        {
            break;
        }
    }

    let leftover = data.local_queue.destroy();
    if !leftover.is_empty() {
        warn!(
            "worker {} discarding {} queued task(s) at shutdown",
            data.id,
            leftover.len()
        );
        for task in leftover {
            if let Some(cb) = task.on_complete {
                cb(task.id);
            }
        }
    }
    runtime.free_runtime();
}

fn adjuster_main(
    shared: Arc<PoolShared>,
    pool_mutex: Arc<Mutex<Vec<Arc<ThreadData>>>>,
    next_thread_id: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    config: PoolConfig,
) {
    while !shutting_down.load(Ordering::Acquire) {
        thread::sleep(config.resize_check_interval);
        if shutting_down.load(Ordering::Acquire) {
            break;
        }

        let queued = shared.global_queue.len();
        let mut retired = None;
        {
            let mut threads = pool_mutex.lock();
            let n = threads.len();
            if queued > config.scale_up_queue_threshold && n < config.max_threads {
                let id = next_thread_id.fetch_add(1, Ordering::Relaxed);
                let worker = spawn_worker(
                    id,
                    shared.clone(),
                    pool_mutex.clone(),
                    shutting_down.clone(),
                    config.clone(),
                );
                debug!("scaling pool up to {} worker(s)", n + 1);
                threads.push(worker);
            } else if queued == 0 && n > config.min_threads {
                let idle_count = threads.iter().filter(|t| !t.busy.load(Ordering::Acquire)).count();
                if idle_count > config.idle_threshold {
                    if let Some(idx) = threads
                        .iter()
                        .position(|t| !t.busy.load(Ordering::Acquire) && t.local_queue.is_empty())
                    {
                        let victim = threads.remove(idx);
                        victim.should_run.store(false, Ordering::Release);
                        debug!("scaling pool down to {} worker(s)", threads.len());
                        retired = Some(victim);
                    }
                }
            }
        }
        if let Some(victim) = retired {
            if let Some(handle) = victim.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

/// An embedded, multi-threaded execution pool for short-lived scripted
/// jobs.
pub struct Pool {
    shared: Arc<PoolShared>,
    pool_mutex: Arc<Mutex<Vec<Arc<ThreadData>>>>,
    shutting_down: Arc<AtomicBool>,
    next_thread_id: Arc<AtomicUsize>,
    adjuster: Mutex<Option<JoinHandle<()>>>,
    config: PoolConfig,
    /// Cursor for round-robin task affinity in `submit`.
    round_robin: AtomicUsize,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.min_threads == 0 || config.max_threads < config.min_threads {
            return Err(PoolError::SubmissionRefused("invalid thread bounds in pool config"));
        }

        let shared = Arc::new(PoolShared {
            global_queue: TaskQueue::new(config.global_queue_capacity),
            completed: AtomicU64::new(0),
            exec_ns_total: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        });
        let shutting_down = Arc::new(AtomicBool::new(false));
        let pool_mutex = Arc::new(Mutex::new(Vec::new()));
        let next_thread_id = Arc::new(AtomicUsize::new(0));

        {
            let mut threads = pool_mutex.lock();
            for _ in 0..config.initial_threads {
                let id = next_thread_id.fetch_add(1, Ordering::Relaxed);
                threads.push(spawn_worker(
                    id,
                    shared.clone(),
                    pool_mutex.clone(),
                    shutting_down.clone(),
                    config.clone(),
                ));
            }
        }

        let adjuster = if config.dynamic_sizing {
            Some(
                thread::Builder::new()
                    .name("script-pool-adjuster".to_string())
                    .spawn({
                        let shared = shared.clone();
                        let pool_mutex = pool_mutex.clone();
                        let next_thread_id = next_thread_id.clone();
                        let shutting_down = shutting_down.clone();
                        let config = config.clone();
                        move || adjuster_main(shared, pool_mutex, next_thread_id, shutting_down, config)
                    })
                    .expect("failed to spawn adjuster thread"),
            )
        } else {
            None
        };

        Ok(Self {
            shared,
            pool_mutex,
            shutting_down,
            next_thread_id,
            adjuster: Mutex::new(adjuster),
            config,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Assigns `task` to a worker's local queue round-robin (giving
    /// work-stealing something to steal), overflowing to the global queue
    /// when that worker's local queue is full or no workers are running.
    fn submit(&self, payload: Payload, on_complete: CompletionCallback) -> Result<TaskId, PoolError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        if payload.len() == 0 {
            return Err(PoolError::SubmissionRefused("payload is empty"));
        }
        let task = Task::new(payload, on_complete);
        let id = task.id;

        // Held across the enqueue attempt itself (not just the lookup) so a
        // concurrent resize can't retire the chosen worker between picking
        // its local queue and handing the task to it.
        let overflow = {
            let threads = self.pool_mutex.lock();
            if threads.is_empty() {
                task
            } else {
                let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
                match threads[cursor % threads.len()].local_queue.enqueue(task) {
                    EnqueueOutcome::Ok => return Ok(id),
                    EnqueueOutcome::Full(task) => task,
                }
            }
        };

        match self.shared.global_queue.enqueue(overflow) {
            EnqueueOutcome::Ok => Ok(id),
            EnqueueOutcome::Full(_) => Err(PoolError::SubmissionRefused("global queue is full")),
        }
    }

    /// Submits script source text for evaluation. `on_complete` runs exactly
    /// once, after the task's execution context and any timers it armed
    /// have been fully torn down.
    pub fn submit_source(
        &self,
        source: impl Into<Vec<u8>>,
        on_complete: CompletionCallback,
    ) -> Result<TaskId, PoolError> {
        self.submit(Payload::Source(source.into()), on_complete)
    }

    /// Submits a pre-compiled bytecode module for evaluation. The blob must
    /// have been produced by this crate's own engine; foreign bytecode is
    /// not validated and its behavior is unspecified.
    pub fn submit_bytecode(
        &self,
        bytecode: impl Into<Vec<u8>>,
        on_complete: CompletionCallback,
    ) -> Result<TaskId, PoolError> {
        self.submit(Payload::Bytecode(bytecode.into()), on_complete)
    }

    /// A task counts as outstanding from the moment a worker reserves it off
    /// a queue until its completion callback actually fires, so this can
    /// never report quiescent while a task is still mid-flight — including
    /// one whose script armed a timer and is waiting for it.
    fn is_quiescent(&self) -> bool {
        if self.shared.in_flight.load(Ordering::Acquire) != 0 {
            return false;
        }
        if !self.shared.global_queue.is_empty() {
            return false;
        }
        self.pool_mutex.lock().iter().all(|t| t.local_queue.is_empty())
    }

    /// Blocks until the pool has no queued or in-flight work, or until
    /// `timeout` elapses.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle_lock.lock();
        loop {
            if self.is_quiescent() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WaitError::Timeout);
            }
            let result = self.shared.idle_cv.wait_for(&mut guard, remaining);
            if result.timed_out() && !self.is_quiescent() {
                return Err(WaitError::Timeout);
            }
        }
    }

    /// Grows or shrinks the pool to exactly `target` worker threads,
    /// clamped to `[min_threads, max_threads]`. Threads being removed are
    /// allowed to finish their current task before joining.
    pub fn resize(&self, target: usize) -> Result<(), PoolError> {
        let target = target.clamp(self.config.min_threads, self.config.max_threads);
        let mut to_join = Vec::new();
        {
            let mut threads = self.pool_mutex.lock();
            while threads.len() < target {
                let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
                threads.push(spawn_worker(
                    id,
                    self.shared.clone(),
                    self.pool_mutex.clone(),
                    self.shutting_down.clone(),
                    self.config.clone(),
                ));
            }
            while threads.len() > target {
                if let Some(victim) = threads.pop() {
                    victim.should_run.store(false, Ordering::Release);
                    to_join.push(victim);
                }
            }
        }
        for victim in to_join {
            if let Some(handle) = victim.handle.lock().take() {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let threads = self.pool_mutex.lock();
        let active = threads.iter().filter(|t| t.busy.load(Ordering::Acquire)).count();
        let idle = threads.len().saturating_sub(active);
        let queued = self.shared.global_queue.len()
            + threads.iter().map(|t| t.local_queue.len()).sum::<usize>();
        let completed = self.shared.completed.load(Ordering::Relaxed);
        let exec_ns_total = self.shared.exec_ns_total.load(Ordering::Relaxed);
        let avg_execution_time = if completed > 0 {
            Duration::from_nanos(exec_ns_total / completed)
        } else {
            Duration::ZERO
        };
        let thread_utilization_pct = if threads.is_empty() {
            0.0
        } else {
            active as f64 / threads.len() as f64 * 100.0
        };
        PoolStats {
            active_threads: active,
            idle_threads: idle,
            queued_tasks: queued,
            completed_tasks: completed,
            thread_utilization_pct,
            avg_execution_time,
        }
    }

    pub fn thread_stats(&self, thread_id: usize) -> Result<ThreadStats, PoolError> {
        let threads = self.pool_mutex.lock();
        let data = threads
            .iter()
            .find(|t| t.id == thread_id)
            .ok_or(PoolError::NoSuchThread(thread_id))?;
        Ok(ThreadStats {
            thread_id,
            tasks_processed: data.tasks_processed.load(Ordering::Relaxed),
            idle_time_ms: data.idle_time_ns.load(Ordering::Relaxed) / 1_000_000,
            busy_time_ms: data.busy_time_ns.load(Ordering::Relaxed) / 1_000_000,
        })
    }

    /// Stops accepting new submissions, waits up to `drain_timeout` for
    /// in-flight work to finish, then joins every worker and the adjuster
    /// thread. Any task still queued once the timeout elapses is discarded
    /// and its completion callback invoked anyway, so callers never wait on
    /// a callback that will never fire.
    pub fn shutdown(&self, drain_timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        if self.wait_for_idle(drain_timeout).is_err() {
            warn!("pool shutdown: drain timed out with work still outstanding");
        }

        let threads = std::mem::take(&mut *self.pool_mutex.lock());
        for t in &threads {
            t.should_run.store(false, Ordering::Release);
        }
        for t in threads {
            if let Some(handle) = t.handle.lock().take() {
                let _ = handle.join();
            }
        }
        if let Some(handle) = self.adjuster.lock().take() {
            let _ = handle.join();
        }

        let leftover = self.shared.global_queue.destroy();
        if !leftover.is_empty() {
            warn!("{} task(s) discarded from the global queue at shutdown", leftover.len());
            for task in leftover {
                if let Some(cb) = task.on_complete {
                    cb(task.id);
                }
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            self.shutdown(Duration::from_secs(5));
        }
    }
}
