use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Once};
use std::thread::{Builder, JoinHandle};

use log::trace;

use crate::event_loop::EventLoop;

/// A dedicated OS thread hosting one [`EventLoop`].
///
/// The thread constructs the loop and publishes it to the creator through
/// a one-shot latch, then blocks until [`run`](EventLoopThread::run)
/// releases it. Dropping the handle quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    event_loop: Arc<EventLoop>,
    thread: Option<JoinHandle<()>>,
    run_once: Once,
    run_tx: Mutex<Option<mpsc::Sender<()>>>,
    looping_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Default for EventLoopThread {
    fn default() -> Self {
        Self::new("EventLoopThread")
    }
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> EventLoopThread {
        let name = name.into();
        let (loop_tx, loop_rx) = mpsc::channel();
        let (run_tx, run_rx) = mpsc::channel::<()>();
        let (looping_tx, looping_rx) = mpsc::channel::<()>();

        let thread = Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop =
                    Arc::new(EventLoop::new().expect("failed to create the event loop"));
                // First task the loop drains; its send doubles as the
                // "actually looping" acknowledgement run() waits for.
                event_loop.queue_in_loop(move || {
                    let _ = looping_tx.send(());
                });
                let _ = loop_tx.send(Arc::clone(&event_loop));
                if run_rx.recv().is_ok() {
                    event_loop.run();
                }
                trace!("event loop thread exiting");
            })
            .expect("failed to spawn the event loop thread");

        let event_loop = loop_rx
            .recv()
            .expect("event loop thread died before publishing its loop");

        EventLoopThread {
            name,
            event_loop,
            thread: Some(thread),
            run_once: Once::new(),
            run_tx: Mutex::new(Some(run_tx)),
            looping_rx: Mutex::new(Some(looping_rx)),
        }
    }

    /// The hosted loop. Available as soon as the handle exists, before
    /// [`run`](EventLoopThread::run).
    pub fn get_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.event_loop)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the thread into the loop body. Idempotent; returns only
    /// after the loop is actually looping.
    pub fn run(&self) {
        self.run_once.call_once(|| {
            if let Some(tx) = self.run_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            if let Some(rx) = self.looping_rx.lock().unwrap().take() {
                let _ = rx.recv();
            }
        });
    }

    /// Blocks until the loop thread exits.
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        // Release a never-run thread so quit can be observed.
        self.run();
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed-size pool of [`EventLoopThread`]s with round-robin dispatch.
pub struct EventLoopThreadPool {
    threads: Vec<EventLoopThread>,
    loop_index: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(thread_num: usize, name: impl Into<String>) -> EventLoopThreadPool {
        let name = name.into();
        let threads = (0..thread_num)
            .map(|i| EventLoopThread::new(format!("{}-{}", name, i)))
            .collect();
        EventLoopThreadPool {
            threads,
            loop_index: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Starts every loop thread and stamps each loop with its pool slot.
    pub fn start(&self) {
        for (i, thread) in self.threads.iter().enumerate() {
            thread.get_loop().set_index(i);
            thread.run();
        }
    }

    /// Blocks until all loop threads exit.
    pub fn wait(&mut self) {
        for thread in &mut self.threads {
            thread.wait();
        }
    }

    /// The next loop in round-robin order. Relaxed ordering on the counter
    /// is enough; perfect uniformity is not needed.
    pub fn get_next_loop(&self) -> Option<Arc<EventLoop>> {
        if self.threads.is_empty() {
            return None;
        }
        let index = self.loop_index.fetch_add(1, Ordering::Relaxed);
        Some(self.threads[index % self.threads.len()].get_loop())
    }

    /// A stable per-index loop, for pinning.
    pub fn get_loop(&self, index: usize) -> Option<Arc<EventLoop>> {
        self.threads.get(index).map(|t| t.get_loop())
    }

    pub fn get_loops(&self) -> Vec<Arc<EventLoop>> {
        self.threads.iter().map(|t| t.get_loop()).collect()
    }
}
