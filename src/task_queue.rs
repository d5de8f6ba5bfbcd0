use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use log::trace;

use crate::error::{CoreError, Result};
use crate::event_loop::Task;
use crate::event_loop_thread::EventLoopThread;

/// Something that runs tasks somewhere else.
pub trait TaskQueue: Send + Sync {
    /// Hands `task` to the queue for asynchronous execution.
    fn run_task(&self, task: Task) -> Result<()>;

    fn name(&self) -> &str;

    /// Runs `task` and blocks until it finished.
    fn sync_task(&self, task: Task) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.run_task(Box::new(move || {
            task();
            let _ = tx.send(());
        }))?;
        rx.recv().map_err(|_| CoreError::QueueClosed)
    }
}

/// A serialized executor backed by a dedicated [`EventLoopThread`]: tasks
/// run one after another on that loop's thread, in submission order.
pub struct SerialTaskQueue {
    queue_name: String,
    loop_thread: EventLoopThread,
    stopped: AtomicBool,
}

impl SerialTaskQueue {
    pub fn new(name: impl Into<String>) -> SerialTaskQueue {
        let mut queue_name = name.into();
        if queue_name.is_empty() {
            queue_name = "SerialTaskQueue".to_string();
        }
        let loop_thread = EventLoopThread::new(queue_name.clone());
        loop_thread.run();
        SerialTaskQueue {
            queue_name,
            loop_thread,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn run_task_in_queue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.loop_thread.get_loop().run_in_loop(task);
    }

    /// Whether the queue is executing a task right now.
    pub fn is_running_task(&self) -> bool {
        self.loop_thread.get_loop().is_calling_functions()
    }

    /// Blocks until every task submitted so far has finished.
    pub fn wait_all_tasks_finished(&self) {
        let (tx, rx) = mpsc::channel();
        self.run_task_in_queue(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Quits the backing loop and joins its thread.
    pub fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.loop_thread.get_loop().quit();
            self.loop_thread.wait();
        }
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        trace!("destructing SerialTaskQueue('{}')", self.queue_name);
        self.stop();
    }
}

impl TaskQueue for SerialTaskQueue {
    fn run_task(&self, task: Task) -> Result<()> {
        self.loop_thread.get_loop().run_in_loop(task);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// A classic worker pool: fixed thread count, FIFO hand-off, idempotent
/// stop that joins all workers.
pub struct ConcurrentTaskQueue {
    queue_name: String,
    sender: mpsc::Sender<WorkerMessage>,
    workers: Mutex<Vec<Worker>>,
    worker_count: usize,
    task_count: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl ConcurrentTaskQueue {
    pub fn new(thread_num: usize, name: impl Into<String>) -> ConcurrentTaskQueue {
        assert!(thread_num > 0);
        let queue_name = name.into();
        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let receiver = Arc::new(Mutex::new(receiver));
        let task_count = Arc::new(AtomicUsize::new(0));

        let workers = (0..thread_num)
            .map(|i| {
                Worker::new(
                    format!("{}{}", queue_name, i),
                    Arc::clone(&receiver),
                    Arc::clone(&task_count),
                )
            })
            .collect();

        ConcurrentTaskQueue {
            queue_name,
            sender,
            workers: Mutex::new(workers),
            worker_count: thread_num,
            task_count,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn run_task_in_queue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.task_count.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(WorkerMessage::Task(Box::new(task)))
            .map_err(|_| {
                self.task_count.fetch_sub(1, Ordering::AcqRel);
                CoreError::QueueClosed
            })
    }

    /// Number of tasks accepted but not yet picked up by a worker.
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stops all workers and joins them. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.worker_count {
            let _ = self.sender.send(WorkerMessage::Terminate);
        }
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter_mut() {
            worker.join();
        }
    }
}

impl Drop for ConcurrentTaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskQueue for ConcurrentTaskQueue {
    fn run_task(&self, task: Task) -> Result<()> {
        self.task_count.fetch_add(1, Ordering::AcqRel);
        self.sender.send(WorkerMessage::Task(task)).map_err(|_| {
            self.task_count.fetch_sub(1, Ordering::AcqRel);
            CoreError::QueueClosed
        })
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(
        name: String,
        receiver: Arc<Mutex<mpsc::Receiver<WorkerMessage>>>,
        task_count: Arc<AtomicUsize>,
    ) -> Worker {
        let thread = Builder::new()
            .name(name)
            .spawn(move || loop {
                let message = {
                    let receiver = match receiver.lock() {
                        Ok(receiver) => receiver,
                        Err(_) => break,
                    };
                    match receiver.recv() {
                        Ok(message) => message,
                        Err(_) => break,
                    }
                };
                match message {
                    WorkerMessage::Task(task) => {
                        task_count.fetch_sub(1, Ordering::AcqRel);
                        task();
                    }
                    WorkerMessage::Terminate => break,
                }
            })
            .expect("failed to spawn a task queue worker");
        Worker {
            thread: Some(thread),
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_serial_queue_preserves_order() {
        let queue = SerialTaskQueue::new("test-serial");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let s = seen.clone();
            queue.run_task_in_queue(move || {
                s.lock().unwrap().push(i);
            });
        }
        queue.wait_all_tasks_finished();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_queue_default_name() {
        let queue = SerialTaskQueue::new("");
        assert_eq!(queue.name(), "SerialTaskQueue");
    }

    #[test]
    fn test_serial_queue_is_running_task() {
        let queue = SerialTaskQueue::new("busy");
        let (tx, rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        queue.run_task_in_queue(move || {
            let _ = started_tx.send(());
            let _ = rx.recv();
        });
        let _ = started_rx.recv();
        assert!(queue.is_running_task());
        drop(tx);
        queue.wait_all_tasks_finished();
    }

    #[test]
    fn test_concurrent_queue_runs_everything() {
        let queue = ConcurrentTaskQueue::new(4, "workers");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let c = counter.clone();
            queue
                .run_task_in_queue(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_concurrent_queue_stop_is_idempotent() {
        let queue = ConcurrentTaskQueue::new(2, "stoppers");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        queue
            .run_task_in_queue(move || {
                std::thread::sleep(Duration::from_millis(20));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        queue.stop();
        queue.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1, "in-flight task completes");
    }

    #[test]
    fn test_sync_task_blocks_until_done() {
        let queue = ConcurrentTaskQueue::new(2, "sync");
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        queue
            .sync_task(Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                f.store(true, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
