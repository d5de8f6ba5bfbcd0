use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::buffer::MsgBuffer;

/// Largest chunk pulled from a stream callback or staged from a file in one
/// step.
pub const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Callback that fills `out` with up to `out.len()` bytes and returns how
/// many were produced. Returning 0 signals end-of-stream. On drop the node
/// invokes the callback one final time with an empty sink as a cleanup
/// signal.
pub type StreamCallback = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

/// One element of an outgoing write chain.
///
/// A writer pulls [`get_data`](BufferNode::get_data) from the head node,
/// writes what the transport accepts, retires it with
/// [`retrieve`](BufferNode::retrieve) and drops the node once
/// [`remaining_bytes`](BufferNode::remaining_bytes) reaches zero.
pub enum BufferNode {
    /// Owned bytes.
    Mem(MemNode),
    /// Bytes pulled on demand from a user callback.
    Stream(StreamNode),
    /// Bytes pushed from any thread, terminated by an explicit `done`.
    Async(AsyncNode),
    /// A region of an open file.
    File(FileNode),
}

impl BufferNode {
    /// A node over owned bytes.
    pub fn new_mem() -> BufferNode {
        BufferNode::Mem(MemNode {
            buffer: MsgBuffer::new(),
            is_done: false,
        })
    }

    /// A node that pulls bytes from `callback` in chunks of up to
    /// [`STREAM_CHUNK_SIZE`].
    pub fn new_stream(callback: StreamCallback) -> BufferNode {
        BufferNode::Stream(StreamNode {
            callback: Some(callback),
            staging: MsgBuffer::new(),
            is_done: false,
        })
    }

    /// An async node plus the handle producers use to feed it. The handle
    /// may be cloned and used from any thread.
    pub fn new_async() -> (BufferNode, AsyncStreamHandle) {
        let inner = Arc::new(AsyncInner {
            buffer: Mutex::new(MsgBuffer::new()),
            is_done: AtomicBool::new(false),
        });
        let handle = AsyncStreamHandle {
            inner: Arc::clone(&inner),
        };
        (
            BufferNode::Async(AsyncNode {
                inner,
                staging: MsgBuffer::new(),
            }),
            handle,
        )
    }

    /// A node over `length` bytes of `file` starting at `offset`.
    pub fn new_file(file: File, offset: u64, length: u64) -> BufferNode {
        BufferNode::File(FileNode {
            file,
            offset,
            remaining: length,
            staging: MsgBuffer::new(),
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, BufferNode::File(_))
    }

    /// Async nodes are streams too: their length is unknown until `done`.
    pub fn is_stream(&self) -> bool {
        matches!(self, BufferNode::Stream(_) | BufferNode::Async(_))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, BufferNode::Async(_))
    }

    /// Whether the node can still produce data at some point. Only async
    /// nodes become unavailable (after `done`).
    pub fn available(&self) -> bool {
        match self {
            BufferNode::Async(n) => !n.inner.is_done.load(Ordering::Acquire),
            _ => true,
        }
    }

    /// Marks the node finished. For async nodes producers normally call
    /// [`AsyncStreamHandle::done`] instead.
    pub fn done(&mut self) {
        match self {
            BufferNode::Mem(n) => n.is_done = true,
            BufferNode::Stream(n) => n.is_done = true,
            BufferNode::Async(n) => n.inner.is_done.store(true, Ordering::Release),
            BufferNode::File(n) => n.remaining = 0,
        }
    }

    /// Appends bytes to a memory node. Logs and drops the data for other
    /// node kinds.
    pub fn append(&mut self, data: &[u8]) {
        match self {
            BufferNode::Mem(n) => n.buffer.append(data),
            _ => warn!("append called on a non-memory buffer node"),
        }
    }

    /// The currently sendable bytes, pulling from the underlying source
    /// when the staging area is empty.
    pub fn get_data(&mut self) -> &[u8] {
        match self {
            BufferNode::Mem(n) => n.buffer.peek(),
            BufferNode::Stream(n) => n.pull(),
            BufferNode::Async(n) => n.pull(),
            BufferNode::File(n) => n.stage(),
        }
    }

    /// Retires `len` bytes that the transport accepted.
    pub fn retrieve(&mut self, len: usize) {
        match self {
            BufferNode::Mem(n) => n.buffer.retrieve(len),
            BufferNode::Stream(n) => n.staging.retrieve(len),
            BufferNode::Async(n) => n.staging.retrieve(len),
            BufferNode::File(n) => n.advance(len),
        }
    }

    /// Bytes the node still has to offer. Zero means the node is exhausted
    /// and may be dropped from the chain. A pull stream that has not ended
    /// reports 1 as a placeholder for "unknown, non-zero".
    pub fn remaining_bytes(&self) -> u64 {
        match self {
            BufferNode::Mem(n) => {
                if n.is_done {
                    0
                } else {
                    n.buffer.readable_bytes() as u64
                }
            }
            BufferNode::Stream(n) => {
                if n.is_done {
                    0
                } else if n.staging.readable_bytes() > 0 {
                    n.staging.readable_bytes() as u64
                } else {
                    1
                }
            }
            BufferNode::Async(n) => {
                let shared = n
                    .inner
                    .buffer
                    .lock()
                    .map(|b| b.readable_bytes())
                    .unwrap_or(0);
                let buffered = (n.staging.readable_bytes() + shared) as u64;
                if buffered > 0 {
                    buffered
                } else if n.inner.is_done.load(Ordering::Acquire) {
                    0
                } else {
                    1
                }
            }
            BufferNode::File(n) => n.remaining,
        }
    }

    /// The underlying descriptor of a file node, for sendfile-style
    /// transports that bypass `get_data` and advance via `retrieve`.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            BufferNode::File(n) => Some(n.file.as_raw_fd()),
            _ => None,
        }
    }

    /// Current file offset of a file node.
    pub fn file_offset(&self) -> Option<u64> {
        match self {
            BufferNode::File(n) => Some(n.offset),
            _ => None,
        }
    }
}

pub struct MemNode {
    buffer: MsgBuffer,
    is_done: bool,
}

pub struct StreamNode {
    callback: Option<StreamCallback>,
    staging: MsgBuffer,
    is_done: bool,
}

impl StreamNode {
    fn pull(&mut self) -> &[u8] {
        if self.staging.readable_bytes() == 0 && !self.is_done {
            self.staging.ensure_writable_bytes(STREAM_CHUNK_SIZE);
            let n = match self.callback.as_mut() {
                Some(cb) => cb(self.staging.writable_mut()),
                None => 0,
            };
            if n > 0 {
                self.staging.has_written(n);
            } else {
                self.is_done = true;
            }
        }
        self.staging.peek()
    }
}

impl Drop for StreamNode {
    fn drop(&mut self) {
        // Final call with an empty sink so the callback can release
        // whatever it holds.
        if let Some(mut cb) = self.callback.take() {
            cb(&mut []);
        }
    }
}

struct AsyncInner {
    buffer: Mutex<MsgBuffer>,
    is_done: AtomicBool,
}

pub struct AsyncNode {
    inner: Arc<AsyncInner>,
    staging: MsgBuffer,
}

impl AsyncNode {
    /// Drains whatever producers have pushed into the loop-side staging
    /// buffer, keeping the lock window short.
    fn pull(&mut self) -> &[u8] {
        if let Ok(mut shared) = self.inner.buffer.lock() {
            if shared.readable_bytes() > 0 {
                self.staging.append(shared.peek());
                shared.retrieve_all();
            }
        }
        self.staging.peek()
    }
}

pub struct FileNode {
    file: File,
    offset: u64,
    remaining: u64,
    staging: MsgBuffer,
}

impl FileNode {
    fn stage(&mut self) -> &[u8] {
        if self.staging.readable_bytes() == 0 && self.remaining > 0 {
            let want = STREAM_CHUNK_SIZE.min(self.remaining as usize);
            self.staging.ensure_writable_bytes(want);
            match self.file.read_at(&mut self.staging.writable_mut()[..want], self.offset) {
                Ok(n) => {
                    self.staging.has_written(n);
                    self.offset += n as u64;
                    if n == 0 {
                        // File shorter than advertised; treat as exhausted.
                        self.remaining = 0;
                    }
                }
                Err(e) => {
                    warn!("file buffer node read error: {}", e);
                    self.remaining = 0;
                }
            }
        }
        self.staging.peek()
    }

    fn advance(&mut self, len: usize) {
        let staged = self.staging.readable_bytes();
        self.staging.retrieve(len.min(staged));
        if len > staged {
            // sendfile-style transport consumed directly from the file
            self.offset += (len - staged) as u64;
        }
        self.remaining = self.remaining.saturating_sub(len as u64);
    }
}

/// Producer-side handle of an async stream node. Clone freely; append from
/// any thread; call [`done`](AsyncStreamHandle::done) to terminate the
/// stream.
#[derive(Clone)]
pub struct AsyncStreamHandle {
    inner: Arc<AsyncInner>,
}

impl AsyncStreamHandle {
    pub fn append(&self, data: &[u8]) {
        if self.inner.is_done.load(Ordering::Acquire) {
            warn!("append to a finished async stream node dropped");
            return;
        }
        if let Ok(mut buf) = self.inner.buffer.lock() {
            buf.append(data);
        }
    }

    pub fn done(&self) {
        self.inner.is_done.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_mem_node_drains_to_zero() {
        let mut node = BufferNode::new_mem();
        node.append(b"hello");
        assert_eq!(node.remaining_bytes(), 5);
        assert_eq!(node.get_data(), b"hello");

        node.retrieve(2);
        assert_eq!(node.get_data(), b"llo");
        node.retrieve(3);
        assert_eq!(node.remaining_bytes(), 0);
    }

    #[test]
    fn test_mem_node_done_hides_leftover() {
        let mut node = BufferNode::new_mem();
        node.append(b"leftover");
        node.done();
        assert_eq!(node.remaining_bytes(), 0);
    }

    #[test]
    fn test_stream_node_pulls_in_chunks_until_eos() {
        let produced = Arc::new(AtomicUsize::new(0));
        let p = produced.clone();
        let mut total = 40usize;
        let mut node = BufferNode::new_stream(Box::new(move |out| {
            if out.is_empty() {
                return 0;
            }
            let n = out.len().min(total).min(16);
            for b in &mut out[..n] {
                *b = b'x';
            }
            total -= n;
            p.fetch_add(n, Ordering::SeqCst);
            n
        }));

        assert!(node.is_stream());
        let mut got = 0;
        loop {
            let chunk = node.get_data().len();
            if chunk == 0 {
                break;
            }
            got += chunk;
            node.retrieve(chunk);
        }
        assert_eq!(got, 40);
        assert_eq!(node.remaining_bytes(), 0);
        assert_eq!(produced.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn test_stream_node_unknown_length_placeholder() {
        let mut fed = false;
        let mut node = BufferNode::new_stream(Box::new(move |out| {
            if out.is_empty() || fed {
                return 0;
            }
            fed = true;
            out[0] = b'!';
            1
        }));
        // Nothing staged yet, stream not ended: non-zero placeholder.
        assert_eq!(node.remaining_bytes(), 1);
        assert_eq!(node.get_data(), b"!");
    }

    #[test]
    fn test_stream_node_cleanup_call_on_drop() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = cleaned.clone();
        let node = BufferNode::new_stream(Box::new(move |out| {
            if out.is_empty() {
                c.fetch_add(1, Ordering::SeqCst);
            }
            0
        }));
        drop(node);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_async_node_append_from_other_thread() {
        let (mut node, handle) = BufferNode::new_async();
        assert!(node.is_async() && node.is_stream());
        assert!(node.available());
        // Empty but not done: placeholder keeps the node in the chain.
        assert_eq!(node.remaining_bytes(), 1);

        let h = handle.clone();
        let t = std::thread::spawn(move || {
            h.append(b"from afar");
            h.done();
        });
        t.join().unwrap();

        assert_eq!(node.get_data(), b"from afar");
        node.retrieve(9);
        assert_eq!(node.remaining_bytes(), 0);
        assert!(!node.available());
    }

    #[test]
    fn test_async_node_append_after_done_is_dropped() {
        let (mut node, handle) = BufferNode::new_async();
        handle.done();
        handle.append(b"too late");
        assert_eq!(node.get_data(), b"");
        assert_eq!(node.remaining_bytes(), 0);
    }

    #[test]
    fn test_file_node_stages_and_advances() {
        let mut file = tempfile();
        file.write_all(&vec![7u8; 1000]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut node = BufferNode::new_file(file, 100, 500);
        assert!(node.is_file());
        assert!(node.fd().is_some());
        assert_eq!(node.remaining_bytes(), 500);

        let first = node.get_data().len();
        assert_eq!(first, 500);
        node.retrieve(200);
        assert_eq!(node.remaining_bytes(), 300);
        node.retrieve(300);
        assert_eq!(node.remaining_bytes(), 0);
    }

    #[test]
    fn test_file_node_sendfile_path_advances_offset() {
        let mut file = tempfile();
        file.write_all(&vec![9u8; 256]).unwrap();

        let mut node = BufferNode::new_file(file, 0, 256);
        // Transport bypasses get_data and advances directly.
        node.retrieve(100);
        assert_eq!(node.file_offset(), Some(100));
        assert_eq!(node.remaining_bytes(), 156);
    }

    fn tempfile() -> File {
        let mut path = std::env::temp_dir();
        let unique = format!(
            "spindle-io-node-test-{}-{:p}",
            std::process::id(),
            &path as *const _
        );
        path.push(unique);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
