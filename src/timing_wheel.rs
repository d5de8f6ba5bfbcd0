use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use crate::event_loop::EventLoop;
use crate::timer::TimerId;

/// Default bucket count per wheel.
pub const DEFAULT_BUCKETS_PER_WHEEL: usize = 100;

/// Default wheel tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// An opaque reference-counted wheel entry. Its destructor runs exactly
/// once, when the last strong reference is released — typically when the
/// bucket holding it is evicted.
pub type Entry = Arc<dyn Any + Send + Sync>;

type Bucket = Vec<Entry>;

/// An entry that runs a callback when destroyed.
///
/// The cleanup side effect attached to a wheel entry: hold one of these in
/// a bucket and the callback fires on eviction. Also used internally as
/// the cascade entry that reinserts an inner entry when an outer bucket is
/// swept.
pub struct CallbackEntry {
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackEntry {
    pub fn new<F>(callback: F) -> CallbackEntry
    where
        F: FnOnce() + Send + 'static,
    {
        CallbackEntry {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl Drop for CallbackEntry {
    fn drop(&mut self) {
        if let Ok(mut cb) = self.callback.lock() {
            if let Some(cb) = cb.take() {
                cb();
            }
        }
    }
}

struct WheelState {
    wheels: Vec<VecDeque<Bucket>>,
    ticks: u64,
}

/// A hierarchical timing wheel: coarse-grained bucketed expiry for large
/// populations of idle entries.
///
/// `W` wheels of `B` buckets each advance one bucket per tick; an entry
/// inserted at delay `d` has its last strong reference released at least
/// `d` from insertion (give or take one tick on cascade). The maximum
/// representable delay is `tick_interval * B^W`; longer delays clamp to
/// the outermost bucket and still fire.
pub struct TimingWheel {
    event_loop: Arc<EventLoop>,
    state: Arc<Mutex<WheelState>>,
    timer_id: TimerId,
    tick_interval: Duration,
    wheels_num: usize,
    buckets_per_wheel: usize,
}

impl TimingWheel {
    /// Builds a wheel able to cover `max_timeout`, growing the wheel count
    /// until `B^W` ticks reach it, and starts the tick timer on
    /// `event_loop`.
    pub fn new(
        event_loop: Arc<EventLoop>,
        max_timeout: Duration,
        tick_interval: Duration,
        buckets_per_wheel: usize,
    ) -> TimingWheel {
        assert!(max_timeout > tick_interval);
        assert!(tick_interval > Duration::ZERO);
        assert!(buckets_per_wheel > 1);

        let max_tick_num = (max_timeout.as_nanos() / tick_interval.as_nanos()) as u64;
        let buckets = buckets_per_wheel as u64;
        let mut ticks_num = buckets;
        let mut wheels_num = 1usize;
        while max_tick_num > ticks_num {
            wheels_num += 1;
            ticks_num = ticks_num.saturating_mul(buckets);
        }

        let mut wheels = Vec::with_capacity(wheels_num);
        for _ in 0..wheels_num {
            let mut wheel = VecDeque::with_capacity(buckets_per_wheel);
            wheel.resize_with(buckets_per_wheel, Bucket::new);
            wheels.push(wheel);
        }
        let state = Arc::new(Mutex::new(WheelState { wheels, ticks: 0 }));

        let tick_state = Arc::clone(&state);
        let timer_id = event_loop.run_every(tick_interval, move || {
            // Swap evicted buckets out under the lock and drop them after,
            // so entry destructors (cascade reinsertion included) run
            // without holding it.
            let mut evicted: Vec<Bucket> = Vec::new();
            {
                let mut state = tick_state.lock().unwrap();
                state.ticks += 1;
                let t = state.ticks;
                let mut pow = 1u64;
                for i in 0..wheels_num {
                    if t % pow == 0 {
                        if let Some(bucket) = state.wheels[i].pop_front() {
                            evicted.push(bucket);
                        }
                        state.wheels[i].push_back(Bucket::new());
                    }
                    pow = pow.saturating_mul(buckets);
                }
            }
            drop(evicted);
        });

        TimingWheel {
            event_loop,
            state,
            timer_id,
            tick_interval,
            wheels_num,
            buckets_per_wheel,
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn wheels_num(&self) -> usize {
        self.wheels_num
    }

    pub fn buckets_per_wheel(&self) -> usize {
        self.buckets_per_wheel
    }

    /// Binds `entry` to a bucket so its last strong reference is released
    /// at least `delay` from now. Callable from any thread; off-thread
    /// calls are posted to the loop.
    pub fn insert_entry(&self, delay: Duration, entry: Entry) {
        if delay == Duration::ZERO {
            return;
        }
        let delay_ticks = (delay.as_nanos() / self.tick_interval.as_nanos()) as u64 + 1;
        if self.event_loop.is_in_loop_thread() {
            insert_in_loop(
                &self.state,
                self.wheels_num,
                self.buckets_per_wheel as u64,
                delay_ticks,
                entry,
            );
        } else {
            let state = Arc::clone(&self.state);
            let wheels_num = self.wheels_num;
            let buckets = self.buckets_per_wheel as u64;
            self.event_loop.run_in_loop(move || {
                insert_in_loop(&state, wheels_num, buckets, delay_ticks, entry);
            });
        }
    }
}

fn insert_in_loop(
    state: &Arc<Mutex<WheelState>>,
    wheels_num: usize,
    buckets: u64,
    delay_ticks: u64,
    entry: Entry,
) {
    let mut guard = state.lock().unwrap();
    let mut delay = delay_ticks;
    let mut t = guard.ticks;
    let mut entry = entry;

    for i in 0..wheels_num {
        if delay <= buckets {
            if let Some(bucket) = guard.wheels[i].get_mut((delay - 1) as usize) {
                bucket.push(entry);
            }
            return;
        }
        if i < wheels_num - 1 {
            // Cascade: when the outer bucket is swept, reinsert the inner
            // entry into this wheel with the residual delay. The slot
            // arithmetic is biased by the current tick position, so a
            // cascaded entry may fire one tick early; documented
            // tolerance.
            let cascade_state = Arc::clone(state);
            let inner = entry;
            let residual = delay;
            let tick_pos = t;
            let wheel_index = i;
            entry = Arc::new(CallbackEntry::new(move || {
                if residual > 0 {
                    let slot = ((residual + (tick_pos % buckets) - 1) % buckets) as usize;
                    let mut guard = cascade_state.lock().unwrap();
                    if let Some(bucket) = guard.wheels[wheel_index].get_mut(slot) {
                        bucket.push(inner);
                    }
                }
            }));
        } else {
            // Longer than the wheel can represent: clamp to the outermost
            // bucket rather than dropping.
            trace!("timing wheel delay clamped to the outermost bucket");
            if let Some(bucket) = guard.wheels[i].back_mut() {
                bucket.push(entry);
            }
            return;
        }
        delay = (delay + (t % buckets) - 1) / buckets;
        t /= buckets;
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.event_loop.invalidate_timer(self.timer_id);
        // Clear outermost-first so cascade destructors still find their
        // inner wheels; buckets are dropped outside the lock because those
        // destructors take it again.
        for i in (0..self.wheels_num).rev() {
            let buckets: Vec<Bucket> = {
                let mut state = self.state.lock().unwrap();
                state.wheels[i].drain(..).collect()
            };
            drop(buckets);
        }
        trace!("timing wheel destructed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_geometry_grows_with_max_timeout() {
        let t = std::thread::spawn(|| {
            let event_loop = Arc::new(EventLoop::new().unwrap());
            let wheel = TimingWheel::new(
                event_loop.clone(),
                Duration::from_millis(1600),
                Duration::from_millis(100),
                4,
            );
            // 16 ticks needs two wheels of four buckets.
            assert_eq!(wheel.wheels_num(), 2);
            assert_eq!(wheel.buckets_per_wheel(), 4);

            let big = TimingWheel::new(
                event_loop,
                Duration::from_secs(75),
                Duration::from_millis(100),
                100,
            );
            assert_eq!(big.wheels_num(), 2);
        });
        t.join().unwrap();
    }

    #[test]
    fn test_entry_evicted_after_delay() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let wheel = TimingWheel::new(
            event_loop.clone(),
            Duration::from_millis(400),
            Duration::from_millis(20),
            5,
        );

        let drops = Arc::new(AtomicUsize::new(0));
        wheel.insert_entry(
            Duration::from_millis(60),
            Arc::new(Tracked(drops.clone())),
        );

        let d = drops.clone();
        event_loop.run_after(Duration::from_millis(30), move || {
            assert_eq!(d.load(Ordering::SeqCst), 0, "dropped too early");
        });
        let el = event_loop.clone();
        event_loop.run_after(Duration::from_millis(200), move || el.quit());

        event_loop.run();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(wheel);
    }

    #[test]
    fn test_clamped_entry_still_fires_on_wheel_drop() {
        let t = std::thread::spawn(|| {
            let event_loop = Arc::new(EventLoop::new().unwrap());
            let wheel = TimingWheel::new(
                event_loop.clone(),
                Duration::from_millis(100),
                Duration::from_millis(10),
                4,
            );
            let drops = Arc::new(AtomicUsize::new(0));
            // Far beyond tick_interval * B^W; must clamp, not vanish.
            wheel.insert_entry(Duration::from_secs(3600), Arc::new(Tracked(drops.clone())));
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            drop(wheel);
            assert_eq!(drops.load(Ordering::SeqCst), 1, "clamped entry was dropped silently");
        });
        t.join().unwrap();
    }

    #[test]
    fn test_refreshed_entry_survives() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let wheel = Arc::new(TimingWheel::new(
            event_loop.clone(),
            Duration::from_millis(400),
            Duration::from_millis(20),
            5,
        ));

        let drops = Arc::new(AtomicUsize::new(0));
        let entry: Entry = Arc::new(Tracked(drops.clone()));
        wheel.insert_entry(Duration::from_millis(60), entry.clone());

        // Touch: a fresh strong reference pushes the horizon out.
        let w = wheel.clone();
        let touched = entry.clone();
        event_loop.run_after(Duration::from_millis(50), move || {
            w.insert_entry(Duration::from_millis(120), touched.clone());
        });
        drop(entry);

        let d = drops.clone();
        event_loop.run_after(Duration::from_millis(100), move || {
            assert_eq!(d.load(Ordering::SeqCst), 0, "touched entry must survive");
        });
        let el = event_loop.clone();
        event_loop.run_after(Duration::from_millis(250), move || el.quit());

        event_loop.run();
        assert_eq!(drops.load(Ordering::SeqCst), 1, "expires after the refresh lapses");
    }
}
