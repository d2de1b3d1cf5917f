//! Device files and standard-stream sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::UNIX_EPOCH;

use crate::vfs::{FileAttr, FileHandle, FileMode, FileType, VfsError, VfsResult};

/// `/dev/null`: reads hit end-of-stream, writes vanish.
#[derive(Debug)]
pub struct NullFile {
    path: String,
}

impl NullFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Attributes reported for character devices and the standard streams.
pub(crate) fn char_device_attr() -> FileAttr {
    FileAttr {
        size: 0,
        mode: FileMode::new(FileType::CharDevice, 0o666),
        mtime: UNIX_EPOCH,
    }
}

#[async_trait]
impl FileHandle for NullFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, _buf: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::EndOfStream)
    }

    async fn read_at(&mut self, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::EndOfStream)
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        Ok(buf.len())
    }

    async fn write_at(&mut self, buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Ok(buf.len())
    }

    async fn seek(&mut self, _pos: std::io::SeekFrom) -> VfsResult<u64> {
        Ok(0)
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        Ok(char_device_attr())
    }
}

/// Which standard output stream a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    fn index(self) -> usize {
        match self {
            StdStream::Stdout => 0,
            StdStream::Stderr => 1,
        }
    }
}

/// Receives complete lines written to descriptors 1 and 2.
pub trait OutputSink: Send + Sync {
    fn emit(&self, stream: StdStream, line: &[u8]);
}

/// Default sink: one tracing event per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn emit(&self, stream: StdStream, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\n');
        match stream {
            StdStream::Stdout => tracing::info!(target: "hackpad::stdout", "{text}"),
            StdStream::Stderr => tracing::info!(target: "hackpad::stderr", "{text}"),
        }
    }
}

/// Sink that keeps everything it is given. Handy for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    captured: Mutex<[Vec<u8>; 2]>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted on `stream` so far.
    pub fn contents(&self, stream: StdStream) -> Vec<u8> {
        self.captured.lock()[stream.index()].clone()
    }
}

impl OutputSink for MemorySink {
    fn emit(&self, stream: StdStream, line: &[u8]) {
        self.captured.lock()[stream.index()].extend_from_slice(line);
    }
}

/// Accumulates bytes and releases them a line at a time.
#[derive(Debug)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// Append `data`, returning whatever is ready to emit: everything up to
    /// the last newline, or the whole buffer once it grows past the limit.
    pub(crate) fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);
        if self.pending.len() > self.limit {
            return Some(std::mem::take(&mut self.pending));
        }
        let end = self.pending.iter().rposition(|&b| b == b'\n')? + 1;
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Drain any partial line.
    pub(crate) fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Line-buffered front for an [`OutputSink`], one buffer per stream.
pub(crate) struct StdOutputs {
    sink: std::sync::Arc<dyn OutputSink>,
    buffers: Mutex<[LineBuffer; 2]>,
}

impl StdOutputs {
    pub(crate) fn new(sink: std::sync::Arc<dyn OutputSink>, limit: usize) -> Self {
        Self {
            sink,
            buffers: Mutex::new([LineBuffer::new(limit), LineBuffer::new(limit)]),
        }
    }

    pub(crate) fn write(&self, stream: StdStream, data: &[u8]) -> usize {
        let ready = self.buffers.lock()[stream.index()].push(data);
        if let Some(chunk) = ready {
            self.emit_lines(stream, &chunk);
        }
        data.len()
    }

    pub(crate) fn flush(&self) {
        for stream in [StdStream::Stdout, StdStream::Stderr] {
            let rest = self.buffers.lock()[stream.index()].flush();
            if let Some(chunk) = rest {
                self.sink.emit(stream, &chunk);
            }
        }
    }

    fn emit_lines(&self, stream: StdStream, chunk: &[u8]) {
        for line in chunk.split_inclusive(|&b| b == b'\n') {
            self.sink.emit(stream, line);
        }
    }
}
