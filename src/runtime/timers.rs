use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::Persistent;

use super::context::ContextId;

/// Script-visible timer handle. Wraps back to 1 on overflow, matching the
/// spec's description of the id counter as a 31-bit wrapping sequence (the
/// sign bit is never set so ids survive a round trip through a JS number).
pub type TimerId = i32;

pub(super) const DEFAULT_BUCKET_COUNT: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum TimerMode {
    OneShot,
    Periodic,
}

pub(super) struct TimerRecord {
    pub(super) id: TimerId,
    pub(super) context: ContextId,
    pub(super) callback: Persistent<rquickjs::Function<'static>>,
    pub(super) mode: TimerMode,
    pub(super) delay: Duration,
}

/// Fixed bucket-count chained hash table keyed by timer id, giving
/// `clearTimeout`/`clearInterval` O(1) average lookup independent of how
/// many timers are outstanding. Firing order is tracked separately by a
/// deadline-ordered min-heap living alongside this table on the runtime —
/// this structure answers "does id N still exist", the heap answers
/// "what's due next".
pub struct TimerRegistry {
    buckets: Mutex<Vec<Vec<TimerRecord>>>,
    next_id: Mutex<TimerId>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::with_bucket_count(DEFAULT_BUCKET_COUNT)
    }

    pub fn with_bucket_count(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: Mutex::new((0..bucket_count).map(|_| Vec::new()).collect()),
            next_id: Mutex::new(1),
        }
    }

    fn bucket_index(&self, id: TimerId, bucket_count: usize) -> usize {
        (id as u64 % bucket_count as u64) as usize
    }

    /// Allocates the next free id, wrapping past `i32::MAX` back to 1 and
    /// skipping any id still outstanding.
    pub(super) fn allocate_id(&self) -> TimerId {
        let mut next = self.next_id.lock();
        loop {
            let candidate = *next;
            *next = if candidate == i32::MAX { 1 } else { candidate + 1 };
            if !self.contains(candidate) {
                return candidate;
            }
        }
    }

    pub(super) fn insert(&self, record: TimerRecord) {
        let mut buckets = self.buckets.lock();
        let idx = self.bucket_index(record.id, buckets.len());
        buckets[idx].push(record);
    }

    fn contains(&self, id: TimerId) -> bool {
        let buckets = self.buckets.lock();
        let idx = self.bucket_index(id, buckets.len());
        buckets[idx].iter().any(|r| r.id == id)
    }

    /// Removes and returns the record for `id`, if it still exists. Used by
    /// both explicit cancellation and the one-shot fire path.
    pub(super) fn remove(&self, id: TimerId) -> Option<TimerRecord> {
        let mut buckets = self.buckets.lock();
        let idx = self.bucket_index(id, buckets.len());
        let bucket = &mut buckets[idx];
        let pos = bucket.iter().position(|r| r.id == id)?;
        Some(bucket.swap_remove(pos))
    }

    /// Removes every timer owned by `context`, for context teardown. Returns
    /// them so the caller can drop their persistent callbacks outside the
    /// lock.
    pub(super) fn remove_for_context(&self, context: ContextId) -> Vec<TimerRecord> {
        let mut buckets = self.buckets.lock();
        let mut removed = Vec::new();
        for bucket in buckets.iter_mut() {
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].context == context {
                    removed.push(bucket.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline-ordered sibling to [`TimerRegistry`]: answers "what fires next"
/// in O(log n) without requiring the id table itself to be kept in any
/// particular order. Entries are never removed from the heap directly —
/// cancellation only removes from `TimerRegistry`, and the fire loop treats
/// a heap entry whose id is no longer present as a stale no-op.
pub(super) struct DeadlineQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, TimerId)>>>,
}

impl DeadlineQueue {
    pub(super) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub(super) fn push(&self, deadline: Instant, id: TimerId) {
        self.heap.lock().push(Reverse((deadline, id)));
    }

    /// Pops and returns the next `(deadline, id)` pair if it is due by `now`,
    /// without removing entries that aren't due yet.
    pub(super) fn pop_due(&self, now: Instant) -> Option<(Instant, TimerId)> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => {
                heap.pop().map(|Reverse(pair)| pair)
            }
            _ => None,
        }
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse((deadline, _))| *deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context as JsContext, Function, Runtime as Engine};

    fn sample_record(id: TimerId, context: ContextId) -> TimerRecord {
        let engine = Engine::new().expect("engine should initialize");
        let ctx = JsContext::full(&engine).expect("context should initialize");
        ctx.with(|ctx| TimerRecord {
            id,
            context,
            callback: Persistent::save(&ctx, Function::new(ctx.clone(), || {}).unwrap()),
            mode: TimerMode::OneShot,
            delay: Duration::from_millis(0),
        })
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let registry = TimerRegistry::with_bucket_count(4);
        let id = registry.allocate_id();
        registry.insert(sample_record(id, 0));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = TimerRegistry::with_bucket_count(4);
        let id = registry.allocate_id();
        registry.insert(sample_record(id, 0));
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none(), "removing an already-cleared id is a no-op");
    }

    #[test]
    fn allocate_id_wraps_past_i32_max() {
        let registry = TimerRegistry::with_bucket_count(4);
        *registry.next_id.lock() = i32::MAX;
        assert_eq!(registry.allocate_id(), i32::MAX);
        assert_eq!(registry.allocate_id(), 1);
    }

    #[test]
    fn remove_for_context_only_touches_owning_context() {
        let registry = TimerRegistry::with_bucket_count(4);
        let a = registry.allocate_id();
        registry.insert(sample_record(a, 0));
        let b = registry.allocate_id();
        registry.insert(sample_record(b, 1));

        let removed = registry.remove_for_context(0);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, a);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deadline_queue_respects_ordering_and_staleness() {
        let queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.push(now, 1);
        queue.push(now + Duration::from_secs(10), 2);

        let (_, id) = queue.pop_due(now).expect("first deadline should be due");
        assert_eq!(id, 1);
        assert!(queue.pop_due(now).is_none(), "second deadline is not due yet");
    }
}
