//! Fixed-capacity, non-blocking byte pipes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Notify;

use crate::vfs::{FileAttr, FileHandle, FileMode, FileType, VfsError, VfsResult};

#[derive(Debug, Default)]
struct Queue {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// Byte queue shared by a read end and a write end.
///
/// Neither direction ever waits: reads return what is buffered (possibly
/// nothing) and writes accept what fits.
#[derive(Debug)]
pub struct Pipe {
    name: String,
    capacity: usize,
    created: SystemTime,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Pipe {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            created: SystemTime::now(),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.queue.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Drain up to `buf.len()` bytes.
    ///
    /// An empty open pipe reads zero bytes; an empty closed pipe reports
    /// end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        let mut queue = self.queue.lock();
        if queue.bytes.is_empty() {
            return if queue.closed && !buf.is_empty() {
                Err(VfsError::EndOfStream)
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(queue.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(queue.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    /// Enqueue as much of `buf` as fits.
    pub fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        let n = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return Err(VfsError::bad_descriptor(format!("{}: closed", self.name)));
            }
            let free = self.capacity.saturating_sub(queue.bytes.len());
            let n = free.min(buf.len());
            queue.bytes.extend(&buf[..n]);
            n
        };
        if n > 0 {
            self.notify.notify_waiters();
        }
        Ok(n)
    }

    /// Stop accepting writes. Buffered bytes stay readable.
    pub fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Wait until there is something to read or the pipe is closed.
    pub async fn wait_readable(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let queue = self.queue.lock();
                if !queue.bytes.is_empty() || queue.closed {
                    return;
                }
            }
            notified.await;
        }
    }

    fn attr(&self) -> FileAttr {
        FileAttr {
            size: self.len() as u64,
            mode: FileMode::new(FileType::NamedPipe, 0o600),
            mtime: self.created,
        }
    }
}

/// Read end of a [`Pipe`].
#[derive(Debug)]
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        Self { pipe }
    }
}

#[async_trait]
impl FileHandle for PipeReader {
    fn path(&self) -> &str {
        self.pipe.name()
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.pipe.read(buf)
    }

    async fn write(&mut self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::not_implemented("write to pipe read end"))
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        Ok(self.pipe.attr())
    }
}

/// Write end of a [`Pipe`]. Closing it closes the pipe.
#[derive(Debug)]
pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl PipeWriter {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        Self { pipe }
    }
}

#[async_trait]
impl FileHandle for PipeWriter {
    fn path(&self) -> &str {
        self.pipe.name()
    }

    async fn read(&mut self, _buf: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::not_implemented("read from pipe write end"))
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.pipe.write(buf)
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        Ok(self.pipe.attr())
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.pipe.close();
        Ok(())
    }
}
