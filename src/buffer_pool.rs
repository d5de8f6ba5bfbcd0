use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::buffer::MsgBuffer;

/// A thread-safe pool of [`MsgBuffer`]s for reusing receive-side
/// allocations.
///
/// Buffers are handed out as guards that return to the pool on drop. A
/// returned buffer is drained first, so the next user always starts from
/// the prepend offset.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<MsgBuffer>>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding up to `capacity` buffers of `buffer_size`
    /// initial capacity each, pre-filling it.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let mut pool = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            pool.push_back(MsgBuffer::with_capacity(buffer_size));
        }
        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
            capacity,
        }
    }

    /// Acquires a buffer, creating a fresh one if the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = {
            let mut pool = self.pool.lock().unwrap();
            pool.pop_front()
        };

        let buffer = buffer.unwrap_or_else(|| MsgBuffer::with_capacity(self.buffer_size));

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Approximate number of idle buffers currently pooled.
    pub fn available(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Guard that drains the buffer and returns it to the pool when dropped.
pub struct PooledBuffer {
    buffer: Option<MsgBuffer>,
    pool: Arc<Mutex<VecDeque<MsgBuffer>>>,
    capacity: usize,
}

impl PooledBuffer {
    /// Takes ownership of the buffer, keeping it out of the pool.
    pub fn take(mut self) -> MsgBuffer {
        self.buffer.take().expect("PooledBuffer already taken")
    }
}

impl Deref for PooledBuffer {
    type Target = MsgBuffer;

    #[inline]
    fn deref(&self) -> &MsgBuffer {
        self.buffer.as_ref().expect("PooledBuffer is empty")
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut MsgBuffer {
        self.buffer.as_mut().expect("PooledBuffer is empty")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.retrieve_all();
            let mut pool = self.pool.lock().unwrap();
            // Only return to pool if under capacity
            if pool.len() < self.capacity {
                pool.push_back(buffer);
            }
        }
    }
}
