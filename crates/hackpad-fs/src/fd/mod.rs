//! File descriptor table.
//!
//! Maps numeric descriptors to open handles on the shared filesystem.
//!
//! - Opens of an already-open canonical path share one descriptor
//!   (descriptor aliasing). Each process keeps its own open count on it.
//! - The underlying handle closes exactly once, when every process's count
//!   has dropped to zero.
//! - IDs below [`FsConfig::min_fd`] are the implicit standard streams and
//!   never enter the table.
//! - Opening a path and closing its last descriptor are serialized per path,
//!   so a reopen never races the old handle's close.

mod device;
mod lock;
mod pipe;

pub use device::{MemorySink, NullFile, OutputSink, StdStream, TracingSink};
pub use lock::{LockCoordinator, LockKind, MemoryLockCoordinator};
pub use pipe::{Pipe, PipeReader, PipeWriter};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::FsConfig;
use crate::vfs::path;
use crate::vfs::{ErrorKind, FileAttr, FileHandle, OpenFlags, VfsError, VfsOps, VfsResult};
use device::{char_device_attr, StdOutputs};

/// Process ID used for open-count attribution.
pub type Pid = u32;

/// File descriptor ID.
pub type Fid = u64;

pub const STDIN: Fid = 0;
pub const STDOUT: Fid = 1;
pub const STDERR: Fid = 2;

/// Where a descriptor's handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Opened on the filesystem; `path` is a real canonical path.
    Fs,
    /// A built-in device such as `/dev/null`.
    Device,
    /// One end of a pipe; `path` is the pipe's name.
    Pipe,
}

/// State shared by every descriptor ID that aliases one open handle.
struct FileCore {
    /// Descriptor the path index points at.
    id: Fid,
    path: String,
    origin: Origin,
    handle: tokio::sync::Mutex<Box<dyn FileHandle>>,
    open_counts: Mutex<HashMap<Pid, u64>>,
    lock_held: Mutex<Option<LockKind>>,
}

impl FileCore {
    fn new(id: Fid, path: String, origin: Origin, handle: Box<dyn FileHandle>, pid: Pid) -> Self {
        Self {
            id,
            path,
            origin,
            handle: tokio::sync::Mutex::new(handle),
            open_counts: Mutex::new(HashMap::from([(pid, 1)])),
            lock_held: Mutex::new(None),
        }
    }
}

struct Table {
    next_fid: Fid,
    by_path: HashMap<String, Fid>,
    descriptors: HashMap<Fid, Arc<FileCore>>,
}

impl Table {
    fn allocate(&mut self) -> Fid {
        let fid = self.next_fid;
        self.next_fid += 1;
        fid
    }
}

/// Descriptor table shared by every process using one filesystem.
pub struct FdTable {
    fs: Arc<dyn VfsOps>,
    config: FsConfig,
    locks: Arc<dyn LockCoordinator>,
    outputs: StdOutputs,
    /// Serializes first opens of a path so only one backend handle is made.
    opening: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    table: Mutex<Table>,
    pipes_made: Mutex<u64>,
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTable")
            .field("fs", &self.fs.name())
            .field("descriptors", &self.len())
            .finish()
    }
}

impl FdTable {
    pub fn new(fs: Arc<dyn VfsOps>, config: &FsConfig) -> Self {
        Self {
            fs,
            locks: Arc::new(MemoryLockCoordinator::new()),
            outputs: StdOutputs::new(Arc::new(TracingSink), config.line_buffer_limit),
            opening: DashMap::new(),
            table: Mutex::new(Table {
                next_fid: config.min_fd,
                by_path: HashMap::new(),
                descriptors: HashMap::new(),
            }),
            pipes_made: Mutex::new(0),
            config: config.clone(),
        }
    }

    /// Route descriptor 1 and 2 output somewhere other than tracing.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.outputs = StdOutputs::new(sink, self.config.line_buffer_limit);
        self
    }

    pub fn with_lock_coordinator(mut self, locks: Arc<dyn LockCoordinator>) -> Self {
        self.locks = locks;
        self
    }

    fn is_std(&self, fid: Fid) -> bool {
        fid < self.config.min_fd
    }

    fn core(&self, fid: Fid) -> VfsResult<Arc<FileCore>> {
        self.table
            .lock()
            .descriptors
            .get(&fid)
            .cloned()
            .ok_or_else(|| VfsError::bad_descriptor(fid))
    }

    /// Bump `pid`'s count on the descriptor already open at `path`.
    fn attach(&self, path: &str, pid: Pid) -> Option<Fid> {
        let table = self.table.lock();
        let fid = *table.by_path.get(path)?;
        let core = table.descriptors.get(&fid)?;
        *core.open_counts.lock().entry(pid).or_insert(0) += 1;
        Some(fid)
    }

    fn insert(&self, path: String, origin: Origin, handle: Box<dyn FileHandle>, pid: Pid) -> Fid {
        let mut table = self.table.lock();
        let fid = table.allocate();
        if origin != Origin::Pipe {
            table.by_path.insert(path.clone(), fid);
        }
        table
            .descriptors
            .insert(fid, Arc::new(FileCore::new(fid, path, origin, handle, pid)));
        fid
    }

    /// Per-path gate held while a path's first open or last close runs.
    fn gate(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.opening.entry(path.to_string()).or_default().value())
    }

    fn ungate(&self, path: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        self.opening
            .remove_if(path, |_, g| Arc::ptr_eq(g, gate) && Arc::strong_count(g) <= 2);
    }

    /// Open `path` on behalf of `pid`.
    ///
    /// If the path is already open anywhere, its descriptor is reused and
    /// `flags` are not re-applied.
    pub async fn open(&self, pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Fid> {
        let path = path::normalize(path);
        match path.as_str() {
            "/dev/stdin" => return Ok(STDIN),
            "/dev/stdout" => return Ok(STDOUT),
            "/dev/stderr" => return Ok(STDERR),
            _ => {}
        }
        if let Some(fid) = self.attach(&path, pid) {
            return Ok(fid);
        }

        let gate = self.gate(&path);
        let result = {
            let _guard = gate.lock().await;
            self.open_locked(pid, &path, flags, mode).await
        };
        self.ungate(&path, &gate);
        result
    }

    async fn open_locked(&self, pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Fid> {
        if let Some(fid) = self.attach(path, pid) {
            return Ok(fid);
        }
        let (origin, handle): (Origin, Box<dyn FileHandle>) = if path == "/dev/null" {
            (Origin::Device, Box::new(NullFile::new(path)))
        } else {
            (Origin::Fs, self.fs.open(path, flags, mode).await?)
        };
        let fid = self.insert(path.to_string(), origin, handle, pid);
        tracing::debug!(fid, pid, path = %path, "opened");
        Ok(fid)
    }

    /// New descriptor ID sharing `fid`'s handle. Counts as another open by
    /// `pid`.
    pub fn dup(&self, pid: Pid, fid: Fid) -> VfsResult<Fid> {
        if self.is_std(fid) {
            // Standard streams have no table entry to share.
            return match fid {
                STDIN | STDOUT | STDERR => Ok(fid),
                _ => Err(VfsError::bad_descriptor(fid)),
            };
        }
        let mut table = self.table.lock();
        let core = table
            .descriptors
            .get(&fid)
            .cloned()
            .ok_or_else(|| VfsError::bad_descriptor(fid))?;
        *core.open_counts.lock().entry(pid).or_insert(0) += 1;
        let new_fid = table.allocate();
        table.descriptors.insert(new_fid, core);
        Ok(new_fid)
    }

    /// Create a pipe owned by `pid`, returning `(read, write)` descriptors.
    pub fn pipe(&self, pid: Pid) -> (Fid, Fid) {
        let number = {
            let mut made = self.pipes_made.lock();
            *made += 1;
            *made
        };
        let name = format!("pipe{number}");
        let pipe = Arc::new(Pipe::new(name.clone(), self.config.pipe_capacity));
        let read = self.insert(name.clone(), Origin::Pipe, Box::new(PipeReader::new(Arc::clone(&pipe))), pid);
        let write = self.insert(name, Origin::Pipe, Box::new(PipeWriter::new(pipe)), pid);
        tracing::debug!(pid, read, write, "pipe created");
        (read, write)
    }

    /// Drop `pid`'s hold(s) on `fid`. Returns the core when it is no longer
    /// open anywhere and has been unlinked from the table.
    fn release(&self, fid: Fid, pid: Pid, all: bool) -> VfsResult<Option<Arc<FileCore>>> {
        let mut table = self.table.lock();
        let core = table
            .descriptors
            .get(&fid)
            .cloned()
            .ok_or_else(|| VfsError::bad_descriptor(fid))?;
        {
            let mut counts = core.open_counts.lock();
            let count = counts
                .get_mut(&pid)
                .ok_or_else(|| VfsError::bad_descriptor(format!("{fid} not open in process {pid}")))?;
            *count = if all { 0 } else { count.saturating_sub(1) };
            if *count == 0 {
                counts.remove(&pid);
            }
            if !counts.is_empty() {
                return Ok(None);
            }
        }
        table.descriptors.retain(|_, c| !Arc::ptr_eq(c, &core));
        if table.by_path.get(&core.path) == Some(&core.id) {
            table.by_path.remove(&core.path);
        }
        Ok(Some(core))
    }

    /// Close the backend handle of a core nothing references any more.
    async fn finish(&self, core: Arc<FileCore>) -> VfsResult<()> {
        let held = core.lock_held.lock().take();
        let unlocked = match held {
            Some(_) if core.origin == Origin::Fs => self.locks.unlock(&core.path).await,
            _ => Ok(()),
        };
        let closed = core.handle.lock().await.close().await;
        tracing::debug!(fid = core.id, path = %core.path, "handle closed");
        closed.and(unlocked)
    }

    /// Release under the path gate, closing the handle if this was the
    /// last open anywhere. A concurrent open of the same path waits until
    /// the old handle is closed.
    async fn release_gated(&self, fid: Fid, pid: Pid, all: bool) -> VfsResult<()> {
        let path = self.core(fid)?.path.clone();
        let gate = self.gate(&path);
        let result = {
            let _guard = gate.lock().await;
            match self.release(fid, pid, all) {
                Ok(Some(core)) => self.finish(core).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };
        self.ungate(&path, &gate);
        result
    }

    /// Close one open of `fid` by `pid`.
    pub async fn close(&self, pid: Pid, fid: Fid) -> VfsResult<()> {
        if self.is_std(fid) {
            return Ok(());
        }
        self.release_gated(fid, pid, false).await
    }

    /// Close everything `pid` still holds. Every descriptor is attempted;
    /// the first failure is returned.
    pub async fn close_all(&self, pid: Pid) -> VfsResult<()> {
        let fids: BTreeSet<Fid> = {
            let table = self.table.lock();
            table
                .descriptors
                .iter()
                .filter(|(_, core)| core.open_counts.lock().contains_key(&pid))
                .map(|(fid, _)| *fid)
                .collect()
        };
        let mut first_err = None;
        for fid in fids {
            let outcome = match self.release_gated(fid, pid, true).await {
                // Already released through an alias.
                Err(e) if e.kind() == ErrorKind::BadDescriptor => Ok(()),
                other => other,
            };
            if let Err(e) = outcome {
                tracing::warn!(pid, fid, error = %e, "failed to close descriptor");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every descriptor of every process and flush standard streams.
    pub async fn shutdown(&self) -> VfsResult<()> {
        let pids: BTreeSet<Pid> = {
            let table = self.table.lock();
            table
                .descriptors
                .values()
                .flat_map(|core| core.open_counts.lock().keys().copied().collect::<Vec<_>>())
                .collect()
        };
        let mut result = Ok(());
        for pid in pids {
            let closed = self.close_all(pid).await;
            if result.is_ok() {
                result = closed;
            }
        }
        self.outputs.flush();
        result
    }

    /// Read up to `len` bytes. With `pos`, read at that offset without
    /// moving the cursor. End of file reads as zero bytes.
    pub async fn read(&self, fid: Fid, len: usize, pos: Option<u64>) -> VfsResult<Vec<u8>> {
        if self.is_std(fid) {
            return match fid {
                STDIN => Ok(Vec::new()),
                _ => Err(VfsError::bad_descriptor(fid)),
            };
        }
        let core = self.core(fid)?;
        let mut buf = vec![0u8; len];
        let mut handle = core.handle.lock().await;
        let read = match pos {
            Some(offset) => handle.read_at(&mut buf, offset).await,
            None => handle.read(&mut buf).await,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::EndOfStream => 0,
            Err(e) => return Err(e),
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data`. With `pos`, seek there first.
    pub async fn write(&self, fid: Fid, data: &[u8], pos: Option<u64>) -> VfsResult<usize> {
        if self.is_std(fid) {
            return match fid {
                STDOUT => Ok(self.outputs.write(StdStream::Stdout, data)),
                STDERR => Ok(self.outputs.write(StdStream::Stderr, data)),
                _ => Err(VfsError::bad_descriptor(fid)),
            };
        }
        let core = self.core(fid)?;
        let mut handle = core.handle.lock().await;
        if let Some(offset) = pos {
            handle.seek(SeekFrom::Start(offset)).await?;
        }
        handle.write(data).await
    }

    pub async fn fstat(&self, fid: Fid) -> VfsResult<FileAttr> {
        if self.is_std(fid) {
            return match fid {
                STDIN | STDOUT | STDERR => Ok(char_device_attr()),
                _ => Err(VfsError::bad_descriptor(fid)),
            };
        }
        let core = self.core(fid)?;
        let mut handle = core.handle.lock().await;
        handle.stat().await
    }

    /// Resize the file behind `fid`.
    pub async fn truncate(&self, fid: Fid, size: u64) -> VfsResult<()> {
        if self.is_std(fid) {
            return Err(VfsError::invalid_input(format!("cannot truncate descriptor {fid}")));
        }
        let core = self.core(fid)?;
        let mut handle = core.handle.lock().await;
        handle.truncate(size).await
    }

    /// Flush `fid`'s pending state. Standard streams flush their buffered
    /// partial lines.
    pub async fn sync(&self, fid: Fid) -> VfsResult<()> {
        if self.is_std(fid) {
            return match fid {
                STDIN | STDOUT | STDERR => {
                    self.outputs.flush();
                    Ok(())
                }
                _ => Err(VfsError::bad_descriptor(fid)),
            };
        }
        let core = self.core(fid)?;
        let mut handle = core.handle.lock().await;
        handle.sync().await
    }

    /// Change the permission bits of the file behind `fid`.
    pub async fn chmod(&self, fid: Fid, mode: u32) -> VfsResult<()> {
        if self.is_std(fid) {
            return Err(VfsError::not_implemented(format!("chmod of descriptor {fid}")));
        }
        let core = self.core(fid)?;
        match core.origin {
            Origin::Fs => self.fs.chmod(&core.path, mode).await,
            Origin::Device | Origin::Pipe => {
                Err(VfsError::not_implemented(format!("chmod of {}", core.path)))
            }
        }
    }

    /// Apply an advisory lock operation to `fid`'s path.
    ///
    /// Taking a lock while holding the other kind releases the old one
    /// first. Waiting for a contended lock aborts with cancelled when
    /// `cancel` fires. Pipes and devices belong to this table alone, so
    /// their locks never reach the coordinator.
    pub async fn flock(&self, fid: Fid, kind: LockKind, cancel: &CancellationToken) -> VfsResult<()> {
        let core = self.core(fid)?;
        let coordinated = core.origin == Origin::Fs;
        let held = *core.lock_held.lock();
        if held == Some(kind) {
            return Ok(());
        }
        if held.is_some() {
            core.lock_held.lock().take();
            if coordinated {
                self.locks.unlock(&core.path).await?;
            }
        }
        let shared = match kind {
            LockKind::Unlock => return Ok(()),
            LockKind::Shared => true,
            LockKind::Exclusive => false,
        };
        if !coordinated {
            *core.lock_held.lock() = Some(kind);
            return Ok(());
        }
        lock::acquire(
            self.locks.as_ref(),
            &core.path,
            shared,
            self.config.lock_poll_interval(),
            cancel,
        )
        .await?;
        *core.lock_held.lock() = Some(kind);
        Ok(())
    }

    /// Canonical path (or pipe name) behind `fid`.
    pub fn fid_path(&self, fid: Fid) -> VfsResult<String> {
        Ok(self.core(fid)?.path.clone())
    }

    /// How many times `pid` currently has `fid` open.
    pub fn open_count(&self, fid: Fid, pid: Pid) -> u64 {
        self.core(fid)
            .ok()
            .and_then(|core| core.open_counts.lock().get(&pid).copied())
            .unwrap_or(0)
    }

    pub fn contains(&self, fid: Fid) -> bool {
        self.table.lock().descriptors.contains_key(&fid)
    }

    /// Number of live descriptor IDs, aliases included.
    pub fn len(&self) -> usize {
        self.table.lock().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
