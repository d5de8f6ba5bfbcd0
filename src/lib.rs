//! Callback-driven reactor core for non-blocking network services.
//!
//! Spindle-IO provides the machinery under a non-blocking server: event
//! loops pinned one-to-one to OS threads, a readiness multiplexer, timers
//! (a precise queue plus a coarse timing wheel), cross-thread task
//! dispatch, and the I/O buffers a connection reads into and writes from.
//! There is no async/await; readiness is delivered to plain callbacks on
//! the loop's own thread.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │   channels (fd + callbacks)   timers    posted tasks        │
//! └────────────┬──────────────────────┬──────────┬──────────────┘
//!              │ update_channel       │ run_at/  │ run_in_loop /
//!              ▼                      │ run_every│ queue_in_loop
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventLoop (1 per thread)             │
//! │  ┌──────────┐     ┌────────────┐     ┌─────────────────┐    │
//! │  │ Poller   │────▶│ TimerQueue │────▶│ task queues     │    │
//! │  │ (mio)    │     │ + Wheel    │     │ (lock-free MPSC)│    │
//! │  └──────────┘     └────────────┘     └─────────────────┘    │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS readiness events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each iteration the loop polls for readiness, fires channel callbacks in
//! reported order, expires due timers, then drains the cross-thread task
//! queue. Other threads interact with a loop only through its thread-safe
//! posting surface; everything loop-owned stays on the loop thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use spindle_io::{Channel, EventLoop};
//! use mio::Token;
//! use std::os::unix::io::AsRawFd;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let event_loop = Arc::new(EventLoop::new().unwrap());
//!
//! let listener = mio::net::TcpListener::bind("127.0.0.1:8080".parse().unwrap()).unwrap();
//! let mut channel = Channel::new(Token(1), listener.as_raw_fd());
//! channel.set_read_callback(|| {
//!     // accept here
//! });
//! channel.enable_reading();
//! event_loop.update_channel(channel).unwrap();
//!
//! let el = event_loop.clone();
//! event_loop.run_after(Duration::from_secs(60), move || el.quit());
//! event_loop.run();
//! ```

pub mod buffer;
pub mod buffer_node;
pub mod buffer_pool;
pub mod channel;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod event_loop_thread;
pub mod poll;
pub mod task_queue;
pub mod timer;
pub mod timing_wheel;

pub use buffer::MsgBuffer;
pub use buffer_node::{AsyncStreamHandle, BufferNode, StreamCallback};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use channel::{Channel, EventCallback};
pub use error::{CoreError, Result};
pub use event::PollEvent;
pub use event_loop::{EventLoop, EventLoopConfig, Task};
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use poll::WAKER_TOKEN;
pub use task_queue::{ConcurrentTaskQueue, SerialTaskQueue, TaskQueue};
pub use timer::{TimerId, INVALID_TIMER_ID};
pub use timing_wheel::{CallbackEntry, TimingWheel};
