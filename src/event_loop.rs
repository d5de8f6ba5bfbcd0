use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use lockfree::map::Map as LockFreeMap;
use lockfree::queue::Queue;
use log::{error, trace, warn};
use mio::{Events, Interest, Token};

use crate::channel::Channel;
use crate::error::Result;
use crate::event::PollEvent;
use crate::poll::{probe_ready, Poller};
use crate::timer::{TimerCallback, TimerId, TimerQueue};

/// Default upper bound of one poll call when no timer is due sooner.
pub const DEFAULT_POLL_SLICE_MS: u64 = 10_000;

/// Default capacity of the backend event buffer.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

// A persistent run of failures on the poll or wake descriptor escalates to
// fatal after this many consecutive misses.
const MAX_CONSECUTIVE_IO_FAILURES: u32 = 8;

/// A task posted to a loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

// Cheap per-thread id usable in atomics, assigned on first use.
fn current_thread_id() -> u64 {
    CURRENT_THREAD_ID.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(id);
        }
        id
    })
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

// Which loop occupies which thread; at most one loop per thread.
fn loops_in_threads() -> &'static LockFreeMap<u64, u64> {
    static LOOPS: OnceLock<LockFreeMap<u64, u64>> = OnceLock::new();
    LOOPS.get_or_init(LockFreeMap::new)
}

/// Tuning knobs of an [`EventLoop`].
#[derive(Clone, Debug)]
pub struct EventLoopConfig {
    /// Upper bound of one poll call when no timer is due sooner.
    pub poll_slice: Duration,
    /// Capacity of the backend event buffer.
    pub events_capacity: usize,
}

impl EventLoopConfig {
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_slice: Duration::from_millis(DEFAULT_POLL_SLICE_MS),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

/// Builder for [`EventLoopConfig`].
#[derive(Default)]
pub struct EventLoopConfigBuilder {
    poll_slice: Option<Duration>,
    events_capacity: Option<usize>,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_slice(mut self, slice: Duration) -> Self {
        self.poll_slice = Some(slice);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> EventLoopConfig {
        let default = EventLoopConfig::default();
        EventLoopConfig {
            poll_slice: self.poll_slice.unwrap_or(default.poll_slice),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
        }
    }
}

// Sets the flag for a scope and clears it on drop, panic included.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        FlagGuard(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An event loop bound to one OS thread.
///
/// The loop owns a poller, a timer queue, a wake-up channel and two
/// cross-thread task queues, and drives them from [`run`](EventLoop::run).
/// All channel callbacks, timer callbacks and posted tasks of a loop
/// execute sequentially on its thread; other threads interact only through
/// the thread-safe posting surface (`queue_in_loop`, `run_in_loop`, the
/// timer scheduling calls, `invalidate_timer` and `quit`).
pub struct EventLoop {
    loop_id: u64,
    index: AtomicUsize,
    thread_id: AtomicU64,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_funcs: AtomicBool,
    // Token currently being dispatched, usize::MAX when none. Lets
    // re-entrant channel updates from inside a callback stay safe.
    current_active_token: AtomicUsize,
    wake_failures: AtomicU32,
    poller: Poller,
    timer_queue: TimerQueue,
    funcs: Queue<Task>,
    funcs_on_quit: Queue<Task>,
    config: EventLoopConfig,
}

impl EventLoop {
    /// Creates a loop bound to the current thread.
    ///
    /// Fatal if this thread already hosts a loop.
    pub fn new() -> Result<Self> {
        Self::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<Self> {
        let loop_id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let thread_id = current_thread_id();
        if loops_in_threads().get(&thread_id).is_some() {
            error!("There is already an EventLoop in this thread");
            panic!("an EventLoop already exists in this thread");
        }
        loops_in_threads().insert(thread_id, loop_id);

        Ok(EventLoop {
            loop_id,
            index: AtomicUsize::new(usize::MAX),
            thread_id: AtomicU64::new(thread_id),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_funcs: AtomicBool::new(false),
            current_active_token: AtomicUsize::new(usize::MAX),
            wake_failures: AtomicU32::new(0),
            poller: Poller::new()?,
            timer_queue: TimerQueue::new(),
            funcs: Queue::new(),
            funcs_on_quit: Queue::new(),
            config,
        })
    }

    /// Slot of this loop inside a thread pool.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Whether the caller runs on the thread this loop is bound to.
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id.load(Ordering::Acquire) == current_thread_id()
    }

    pub fn is_running(&self) -> bool {
        self.looping.load(Ordering::Acquire) && !self.quit.load(Ordering::Acquire)
    }

    /// Whether the loop is currently draining posted tasks; a task can use
    /// this to learn it runs inside the drain.
    pub fn is_calling_functions(&self) -> bool {
        self.calling_funcs.load(Ordering::Acquire)
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!("It is forbidden to run loop-private operations outside the loop thread");
            panic!("loop-private operation called from the wrong thread");
        }
    }

    /// Re-binds a freshly constructed loop to the calling thread. Must
    /// precede [`run`](EventLoop::run); fatal once the loop is running or
    /// when the calling thread already hosts a loop.
    pub fn move_to_current_thread(&self) {
        if self.is_running() {
            error!("EventLoop cannot be moved when running");
            panic!("cannot move a running EventLoop");
        }
        if self.is_in_loop_thread() {
            warn!("This EventLoop is already bound to the current thread");
            return;
        }
        let new_thread = current_thread_id();
        if loops_in_threads().get(&new_thread).is_some() {
            error!("There is already an EventLoop in this thread, cannot move another in");
            panic!("an EventLoop already exists in this thread");
        }
        let old_thread = self.thread_id.load(Ordering::Acquire);
        if let Some(guard) = loops_in_threads().get(&old_thread) {
            if *guard.val() == self.loop_id {
                loops_in_threads().remove(&old_thread);
            }
        }
        loops_in_threads().insert(new_thread, self.loop_id);
        self.thread_id.store(new_thread, Ordering::Release);
    }

    /// Adds a channel, or replaces the registration under its token.
    pub fn update_channel(&self, channel: Channel) -> Result<()> {
        self.assert_in_loop_thread();
        self.poller.update_channel(channel)
    }

    /// Retunes the interest mask of a registered channel.
    pub fn set_channel_interest(&self, token: Token, interest: Option<Interest>) -> Result<()> {
        self.assert_in_loop_thread();
        self.poller.set_interest(token, interest)
    }

    /// Removes a channel; no callback for it fires after this returns on
    /// the loop thread. Idempotent.
    pub fn remove_channel(&self, token: Token) -> Result<()> {
        self.assert_in_loop_thread();
        self.poller.remove_channel(token)
    }

    /// Runs the loop until [`quit`](EventLoop::quit) is observed. May only
    /// be called from the loop thread.
    ///
    /// A panic escaping a user callback is caught at loop-body scope: the
    /// looping flag is cleared, the on-quit queue is drained, and the
    /// panic is then resumed so the embedding application observes the
    /// fault.
    pub fn run(&self) {
        assert!(!self.looping.load(Ordering::Acquire));
        self.assert_in_loop_thread();

        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);

        let fault = catch_unwind(AssertUnwindSafe(|| {
            let _looping = FlagGuard::new(&self.looping);
            self.loop_body();
        }))
        .err();

        if fault.is_some() {
            warn!("panic escaped the event loop, running on-quit tasks before resuming");
        }
        while let Some(f) = self.funcs_on_quit.pop() {
            f();
        }
        if let Some(fault) = fault {
            resume_unwind(fault);
        }
    }

    fn loop_body(&self) {
        let mut events = Events::with_capacity(self.config.events_capacity);
        let mut active: Vec<PollEvent> = Vec::new();
        let mut carry_over: Vec<PollEvent> = Vec::new();
        let mut poll_failures = 0u32;

        while !self.quit.load(Ordering::Acquire) {
            active.clear();

            // Still-ready channels from the last iteration make the poll
            // non-blocking so they are serviced promptly.
            let timeout = if carry_over.is_empty() {
                self.timer_queue
                    .next_timeout(Instant::now(), self.config.poll_slice)
            } else {
                Duration::ZERO
            };

            match self.poller.poll(&mut events, Some(timeout), &mut active) {
                Ok(_) => poll_failures = 0,
                Err(e) => {
                    poll_failures += 1;
                    warn!("poll failed ({} consecutive): {}", poll_failures, e);
                    if poll_failures >= MAX_CONSECUTIVE_IO_FAILURES {
                        error!("poll keeps failing, giving up: {}", e);
                        panic!("event loop poll failed {} times in a row", poll_failures);
                    }
                    continue;
                }
            }
            active.append(&mut carry_over);

            {
                let _handling = FlagGuard::new(&self.event_handling);
                for event in &active {
                    let entry = match self.poller.get(event.token()) {
                        Some(entry) => entry,
                        // Removed by an earlier callback this iteration.
                        None => continue,
                    };
                    self.current_active_token
                        .store(event.token().0, Ordering::Release);
                    entry.handle_event(event);

                    if event.is_readable() || event.is_writable() {
                        self.carry_if_still_ready(event.token(), &mut carry_over);
                    }
                }
                self.current_active_token
                    .store(usize::MAX, Ordering::Release);
            }

            self.process_timers();
            self.do_run_in_loop_funcs();
        }
        trace!("event loop {} observed quit", self.loop_id);
    }

    // The backend is edge-triggered; re-probe after dispatch so a channel
    // left readable or writable by its callback is reported again.
    fn carry_if_still_ready(&self, token: Token, carry_over: &mut Vec<PollEvent>) {
        if carry_over.iter().any(|e| e.token() == token) {
            return;
        }
        let entry = match self.poller.get(token) {
            Some(entry) => entry,
            None => return,
        };
        let interest = match entry.interest() {
            Some(interest) => interest,
            None => return,
        };
        let (readable, writable) = probe_ready(entry.fd(), interest);
        if readable || writable {
            carry_over.push(PollEvent::synthetic(token, readable, writable));
        }
    }

    fn process_timers(&self) {
        let now = Instant::now();
        let expired = self.timer_queue.get_expired(now);
        if expired.is_empty() {
            return;
        }
        for timer in &expired {
            timer.run();
        }
        // Re-arm strictly after the callbacks ran; a timer cancelled from
        // inside its own callback stays cancelled.
        self.timer_queue.re_arm(expired, now);
    }

    fn do_run_in_loop_funcs(&self) {
        let _calling = FlagGuard::new(&self.calling_funcs);
        // A drained task may enqueue again; keep going until empty.
        while let Some(f) = self.funcs.pop() {
            f();
        }
    }

    /// Runs `f` on the loop thread: synchronously when the caller is
    /// already there, else posted and woken.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always enqueues `f`, even from the loop thread; it runs after the
    /// current iteration's channel and timer callbacks.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.funcs.push(Box::new(f));
        if !self.is_in_loop_thread() || !self.looping.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Enqueues `f` into the on-quit queue, drained on the loop thread
    /// after the main loop exits (even when a panic escaped the body).
    pub fn run_on_quit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.funcs_on_quit.push(Box::new(f));
    }

    /// Schedules `f` at `when`.
    pub fn run_at<F>(&self, when: Instant, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(Box::new(f), when, Duration::ZERO)
    }

    /// Schedules `f` once, `delay` from now.
    pub fn run_after<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(Box::new(f), Instant::now() + delay, Duration::ZERO)
    }

    /// Schedules `f` every `interval`, first run one interval from now.
    pub fn run_every<F>(&self, interval: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(Box::new(f), Instant::now() + interval, interval)
    }

    fn add_timer(&self, callback: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        let id = self.timer_queue.add_timer(callback, when, interval);
        // The poll timeout was computed before this timer existed.
        if !self.is_in_loop_thread() || !self.looping.load(Ordering::Acquire) {
            self.wakeup();
        }
        id
    }

    /// Cancels a timer. Safe from any thread; idempotent. If the callback
    /// is already running the in-progress call proceeds, but a repeating
    /// timer will not re-arm.
    pub fn invalidate_timer(&self, id: TimerId) {
        self.timer_queue.invalidate_timer(id);
    }

    /// Requests termination. Takes effect at the next top-of-loop check;
    /// the current iteration completes.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Rebuilds the backend state after a fork.
    pub fn reset_after_fork(&self) -> Result<()> {
        self.poller.reset_after_fork()
    }

    fn wakeup(&self) {
        match self.poller.wake() {
            Ok(()) => {
                self.wake_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let n = self.wake_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("wake-up failed ({} consecutive): {}", n, e);
                if n >= MAX_CONSECUTIVE_IO_FAILURES {
                    error!("wake-up keeps failing, giving up: {}", e);
                    panic!("event loop wake-up failed {} times in a row", n);
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.quit();
        // The loop thread always exits; wait for the body to observe the
        // quit flag before tearing the loop down.
        while self.looping.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let thread_id = self.thread_id.load(Ordering::Acquire);
        if let Some(guard) = loops_in_threads().get(&thread_id) {
            if *guard.val() == self.loop_id {
                loops_in_threads().remove(&thread_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_two_loops_in_one_thread_is_fatal() {
        let t = std::thread::spawn(|| {
            let _first = EventLoop::new().unwrap();
            let second = catch_unwind(EventLoop::new);
            assert!(second.is_err());
        });
        t.join().unwrap();
    }

    #[test]
    fn test_run_in_loop_is_inline_on_the_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        event_loop.run_in_loop(move || {
            r.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst), "must run before returning");
    }

    #[test]
    fn test_queue_in_loop_is_never_inline() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let el = event_loop.clone();
        event_loop.queue_in_loop(move || {
            o.lock().unwrap().push("task");
            el.quit();
        });
        order.lock().unwrap().push("caller");

        event_loop.run();
        assert_eq!(*order.lock().unwrap(), vec!["caller", "task"]);
    }

    #[test]
    fn test_timers_fire_in_expiry_order() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(30u64, 30u64), (10, 10), (20, 20)] {
            let f = fired.clone();
            event_loop.run_after(Duration::from_millis(delay), move || {
                f.lock().unwrap().push(label);
            });
        }
        let el = event_loop.clone();
        event_loop.run_after(Duration::from_millis(60), move || el.quit());

        event_loop.run();
        assert_eq!(*fired.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_repeat_timer_stops_after_invalidate() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = event_loop.run_every(Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let el = event_loop.clone();
        event_loop.run_after(Duration::from_millis(23), move || {
            el.invalidate_timer(id);
        });
        let el = event_loop.clone();
        event_loop.run_after(Duration::from_millis(60), move || el.quit());

        event_loop.run();
        let n = hits.load(Ordering::SeqCst);
        assert!(n >= 2 && n <= 5, "expected a handful of hits, got {}", n);
    }

    #[test]
    fn test_on_quit_runs_after_panic_and_panic_resumes() {
        let t = std::thread::spawn(|| {
            let event_loop = Arc::new(EventLoop::new().unwrap());
            let quit_ran = Arc::new(AtomicBool::new(false));

            let q = quit_ran.clone();
            event_loop.run_on_quit(move || q.store(true, Ordering::SeqCst));
            event_loop.run_after(Duration::from_millis(1), || {
                panic!("callback exploded");
            });

            let caught = catch_unwind(AssertUnwindSafe(|| event_loop.run()));
            assert!(caught.is_err(), "panic must be re-raised");
            assert!(quit_ran.load(Ordering::SeqCst), "on-quit must still run");
            assert!(!event_loop.is_running());
        });
        t.join().unwrap();
    }

    #[test]
    fn test_move_to_current_thread_rebinds() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        assert!(event_loop.is_in_loop_thread());

        let el = event_loop.clone();
        let t = std::thread::spawn(move || {
            el.move_to_current_thread();
            assert!(el.is_in_loop_thread());
            let el2 = el.clone();
            el.run_after(Duration::from_millis(1), move || el2.quit());
            el.run();
        });
        t.join().unwrap();
        assert!(!event_loop.is_in_loop_thread());
    }
}
