use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Identifier of a scheduled timer, stable within the process.
pub type TimerId = u64;

/// Reserved id meaning "no timer". Never returned by the queue.
pub const INVALID_TIMER_ID: TimerId = 0;

/// Callback run on the loop thread when a timer expires.
pub type TimerCallback = Box<dyn Fn() + Send + Sync + 'static>;

// Process-wide; ids stay unique across loops.
static TIMERS_CREATED: AtomicU64 = AtomicU64::new(INVALID_TIMER_ID);

/// A scheduled callback with an optional repeat interval.
pub struct Timer {
    id: TimerId,
    interval: Duration,
    callback: TimerCallback,
}

impl Timer {
    fn new(callback: TimerCallback, interval: Duration) -> Arc<Timer> {
        Arc::new(Timer {
            id: TIMERS_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
            interval,
            callback,
        })
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn is_repeat(&self) -> bool {
        self.interval > Duration::ZERO
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn run(&self) {
        (self.callback)();
    }
}

struct HeapEntry {
    when: Instant,
    timer: Arc<Timer>,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.timer.id == other.timer.id
    }
}

impl Ord for HeapEntry {
    // Reversed so the BinaryHeap pops the earliest expiry; ties break
    // toward the smaller id for deterministic simultaneous-timer order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.timer.id.cmp(&self.timer.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    // Live ids; cancellation removes an id and a popped entry whose id is
    // absent is discarded silently.
    active: HashSet<TimerId>,
}

/// Pending timers of one loop: a min-heap keyed (expiry, id) with lazy
/// cancellation.
pub(crate) struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                active: HashSet::new(),
            }),
        }
    }

    /// Schedules `callback` at `when`; a non-zero `interval` re-arms the
    /// timer after each run. Returns the timer's id (never
    /// [`INVALID_TIMER_ID`]).
    pub(crate) fn add_timer(
        &self,
        callback: TimerCallback,
        when: Instant,
        interval: Duration,
    ) -> TimerId {
        let timer = Timer::new(callback, interval);
        let id = timer.id();
        let mut inner = self.inner.lock().unwrap();
        inner.active.insert(id);
        inner.heap.push(HeapEntry { when, timer });
        id
    }

    /// Cancels a timer. Idempotent; unknown and already-fired ids are
    /// ignored. A cancelled id never fires again.
    pub(crate) fn invalidate_timer(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&id);
    }

    /// Expiry of the earliest live timer, if any. Cancelled entries found
    /// at the root are discarded on the way.
    pub(crate) fn earliest_expiry(&self) -> Option<Instant> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(top) = inner.heap.peek() {
            if inner.active.contains(&top.timer.id) {
                return Some(top.when);
            }
            inner.heap.pop();
        }
        None
    }

    /// The poll timeout: time to the earliest expiry, clamped to
    /// `[0, slice]`.
    pub(crate) fn next_timeout(&self, now: Instant, slice: Duration) -> Duration {
        match self.earliest_expiry() {
            Some(when) => when.saturating_duration_since(now).min(slice),
            None => slice,
        }
    }

    /// Pops every live timer with `expiry <= now`, earliest (then smallest
    /// id) first. The caller runs the callbacks and then hands the batch to
    /// [`re_arm`](TimerQueue::re_arm).
    pub(crate) fn get_expired(&self, now: Instant) -> Vec<Arc<Timer>> {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = Vec::new();
        while let Some(top) = inner.heap.peek() {
            if top.when > now {
                break;
            }
            let entry = inner.heap.pop().expect("peeked entry vanished");
            if inner.active.contains(&entry.timer.id) {
                expired.push(entry.timer);
            }
        }
        expired
    }

    /// Re-arms repeating timers to `now + interval`, called strictly after
    /// their callbacks ran. One-shot ids are retired; a timer cancelled
    /// from inside its own callback is not re-armed.
    pub(crate) fn re_arm(&self, expired: Vec<Arc<Timer>>, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        for timer in expired {
            let id = timer.id();
            if timer.is_repeat() && inner.active.contains(&id) {
                let when = now + timer.interval();
                inner.heap.push(HeapEntry { when, timer });
            } else {
                inner.active.remove(&id);
            }
        }
    }
}
