use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::task::Task;

/// Global queues wait up to this long for room to open up before reporting
/// back pressure to the submitter.
pub const ENQUEUE_FULL_WAIT: Duration = Duration::from_millis(100);
/// Workers wait up to this long for a task before re-checking shutdown /
/// stepping their event loop.
pub const DEQUEUE_EMPTY_WAIT: Duration = Duration::from_millis(10);

/// Outcome of [`TaskQueue::enqueue`]. `Full` hands the rejected task back to
/// the caller so it can be retried elsewhere (another queue, or surfaced as
/// back pressure) instead of being silently dropped.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Ok,
    Full(Task),
}

struct State {
    tasks: VecDeque<Task>,
}

/// A thread-safe bounded (or unbounded) FIFO with two back-pressure
/// signals. One instance backs the pool-wide global queue; one more backs
/// each worker's local queue — both use this exact type, per the data
/// model's description of the local queue as "the same type" as the global
/// one.
pub struct TaskQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    /// 0 means unbounded.
    max_size: usize,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size,
        }
    }

    /// Pushes `task` onto the back of the queue. If the queue is bounded and
    /// full, waits up to [`ENQUEUE_FULL_WAIT`] for room; on timeout the task
    /// is handed back to the caller as part of `Full` and nothing is
    /// inserted.
    pub fn enqueue(&self, task: Task) -> EnqueueOutcome {
        let mut guard = self.state.lock();
        if self.max_size > 0 {
            while guard.tasks.len() >= self.max_size {
                let timed_out = self
                    .not_full
                    .wait_for(&mut guard, ENQUEUE_FULL_WAIT)
                    .timed_out();
                if timed_out && guard.tasks.len() >= self.max_size {
                    return EnqueueOutcome::Full(task);
                }
            }
        }
        guard.tasks.push_back(task);
        drop(guard);
        self.not_empty.notify_one();
        EnqueueOutcome::Ok
    }

    /// Pops the front of the queue. Waits up to [`DEQUEUE_EMPTY_WAIT`] for a
    /// task to arrive; returns `None` on timeout rather than blocking
    /// indefinitely, so callers can observe a shutdown signal promptly.
    pub fn dequeue(&self) -> Option<Task> {
        let mut guard = self.state.lock();
        if guard.tasks.is_empty() {
            let timed_out = self
                .not_empty
                .wait_for(&mut guard, DEQUEUE_EMPTY_WAIT)
                .timed_out();
            if timed_out && guard.tasks.is_empty() {
                return None;
            }
        }
        let task = guard.tasks.pop_front();
        let below_cap = self.max_size == 0 || guard.tasks.len() < self.max_size;
        drop(guard);
        if task.is_some() && below_cap {
            self.not_full.notify_one();
        }
        task
    }

    /// Attempts to steal a single task from the back of the queue without
    /// ever blocking the owner. Fails (returns `None`) if the lock is
    /// contended or if stealing would leave the owner with nothing queued —
    /// work-stealing always leaves at least one task behind so the victim's
    /// own pipeline stays warm.
    pub fn try_steal_one(&self) -> Option<Task> {
        let mut guard = self.state.try_lock()?;
        if guard.tasks.len() <= 1 {
            return None;
        }
        let task = guard.tasks.pop_back();
        let below_cap = self.max_size == 0 || guard.tasks.len() < self.max_size;
        drop(guard);
        if below_cap {
            self.not_full.notify_one();
        }
        task
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every remaining task, in FIFO order, for the caller to free.
    /// Used by pool shutdown; never leaves a task behind (spec I7).
    pub fn destroy(&self) -> Vec<Task> {
        self.state.lock().tasks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Payload;

    fn noop_task() -> Task {
        Task::new(Payload::Source(b"1".to_vec()), Box::new(|_| {}))
    }

    #[test]
    fn fifo_order_preserved() {
        let q = TaskQueue::new(0);
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let t = noop_task();
                let id = t.id;
                q.enqueue(t);
                id
            })
            .collect();

        for id in ids {
            let popped = q.dequeue().expect("task should be present");
            assert_eq!(popped.id, id);
        }
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn bounded_queue_reports_full() {
        let q = TaskQueue::new(1);
        assert!(matches!(q.enqueue(noop_task()), EnqueueOutcome::Ok));
        assert!(matches!(q.enqueue(noop_task()), EnqueueOutcome::Full(_)));
        assert!(q.dequeue().is_some());
        assert!(matches!(q.enqueue(noop_task()), EnqueueOutcome::Ok));
    }

    #[test]
    fn steal_leaves_one_behind() {
        let q = TaskQueue::new(0);
        q.enqueue(noop_task());
        assert!(q.try_steal_one().is_none(), "must not steal the last task");

        q.enqueue(noop_task());
        assert!(q.try_steal_one().is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn destroy_drains_everything() {
        let q = TaskQueue::new(0);
        for _ in 0..3 {
            q.enqueue(noop_task());
        }
        assert_eq!(q.destroy().len(), 3);
        assert!(q.is_empty());
    }
}
