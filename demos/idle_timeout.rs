use std::sync::Arc;
use std::time::Duration;

use log::info;
use spindle_io::{CallbackEntry, EventLoop, TimingWheel};

// Tracks an "idle connection": the wheel holds the only strong reference,
// so the entry's destructor fires once the delay lapses.
fn main() {
    env_logger::init();
    info!("start");

    let event_loop = Arc::new(EventLoop::new().unwrap());
    let wheel = TimingWheel::new(
        event_loop.clone(),
        Duration::from_secs(75),
        Duration::from_millis(100),
        100,
    );

    let entry = Arc::new(CallbackEntry::new(|| {
        info!("idle entry evicted, connection would be kicked here");
    }));
    wheel.insert_entry(Duration::from_secs(2), entry);

    let el = event_loop.clone();
    event_loop.run_after(Duration::from_secs(4), move || {
        info!("shutting down");
        el.quit();
    });
    event_loop.run();
}
