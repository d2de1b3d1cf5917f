//! The filesystem context: one mount table plus one descriptor table.
//!
//! A context owns:
//! - A VFS (MountTable) with a root backend
//! - A descriptor table shared by every process
//! - The configuration both were built from
//!
//! It exposes the POSIX-flavored surface the host syscall bridge calls.

use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use crate::cache::ArtifactCache;
use crate::config::FsConfig;
use crate::fd::{FdTable, Fid, LockCoordinator, LockKind, OutputSink, Pid};
use crate::vfs::{
    path, MountInfo, MountTable, OpenFlags, ResultExt, Stat, StorerFs, VfsError, VfsOps, VfsResult,
};

pub struct FsContext {
    config: FsConfig,
    mounts: Arc<MountTable>,
    fds: FdTable,
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("mounts", &self.mounts)
            .field("fds", &self.fds)
            .finish()
    }
}

impl FsContext {
    /// Create a context with `root` bound at `/`.
    pub fn new(root: Arc<dyn VfsOps>, config: FsConfig) -> Self {
        let mounts = Arc::new(MountTable::new(root));
        let fds = FdTable::new(Arc::clone(&mounts) as Arc<dyn VfsOps>, &config);
        Self { config, mounts, fds }
    }

    /// Create a context over a fresh in-memory root.
    pub async fn in_memory(config: FsConfig) -> VfsResult<Self> {
        let root = StorerFs::in_memory().await?;
        Ok(Self::new(Arc::new(root), config))
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.fds = self.fds.with_sink(sink);
        self
    }

    pub fn with_lock_coordinator(mut self, locks: Arc<dyn LockCoordinator>) -> Self {
        self.fds = self.fds.with_lock_coordinator(locks);
        self
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Get the VFS mount table.
    pub fn vfs(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    // ========================================================================
    // Mounts
    // ========================================================================

    /// Mount a filesystem at the given path.
    pub async fn mount(&self, path: &str, fs: Arc<dyn VfsOps>) -> VfsResult<()> {
        self.mounts.mount(path, fs).await
    }

    /// Mount `fs` at `path` behind an artifact cache scoped by the
    /// configured artifact-cache prefixes. Compile through the returned
    /// layer; writes made through this context invalidate it.
    pub async fn mount_with_artifacts<A>(
        &self,
        path: &str,
        fs: Arc<dyn VfsOps>,
    ) -> VfsResult<Arc<ArtifactCache<A>>>
    where
        A: Clone + Send + Sync + 'static,
    {
        let path = path::normalize(path);
        let layer = Arc::new(ArtifactCache::new(fs, self.config.artifact_cache_predicate(&path)));
        self.mounts
            .mount(&path, Arc::clone(&layer) as Arc<dyn VfsOps>)
            .await?;
        Ok(layer)
    }

    /// List all mounts, root first.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.list_mounts()
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    pub async fn open(&self, pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Fid> {
        self.fds.open(pid, path, flags, mode).await
    }

    pub async fn close(&self, pid: Pid, fid: Fid) -> VfsResult<()> {
        self.fds.close(pid, fid).await
    }

    pub fn dup(&self, pid: Pid, fid: Fid) -> VfsResult<Fid> {
        self.fds.dup(pid, fid)
    }

    pub async fn read(&self, fid: Fid, len: usize, pos: Option<u64>) -> VfsResult<Vec<u8>> {
        self.fds.read(fid, len, pos).await
    }

    pub async fn write(&self, fid: Fid, data: &[u8], pos: Option<u64>) -> VfsResult<usize> {
        self.fds.write(fid, data, pos).await
    }

    pub async fn fstat(&self, fid: Fid) -> VfsResult<Stat> {
        let attr = self.fds.fstat(fid).await?;
        Ok(Stat::from_attr(&attr, self.config.block_size))
    }

    pub async fn ftruncate(&self, fid: Fid, size: u64) -> VfsResult<()> {
        self.fds.truncate(fid, size).await
    }

    pub async fn fsync(&self, fid: Fid) -> VfsResult<()> {
        self.fds.sync(fid).await
    }

    pub async fn fchmod(&self, fid: Fid, mode: u32) -> VfsResult<()> {
        self.fds.chmod(fid, mode).await
    }

    pub fn pipe(&self, pid: Pid) -> (Fid, Fid) {
        self.fds.pipe(pid)
    }

    pub async fn flock(&self, fid: Fid, kind: LockKind, cancel: &CancellationToken) -> VfsResult<()> {
        self.fds.flock(fid, kind, cancel).await
    }

    /// Process teardown: close everything `pid` holds.
    pub async fn close_all(&self, pid: Pid) -> VfsResult<()> {
        self.fds.close_all(pid).await
    }

    /// Close every descriptor of every process.
    pub async fn shutdown(&self) -> VfsResult<()> {
        let result = self.fds.shutdown().await;
        tracing::info!("filesystem context shut down");
        result
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub async fn stat(&self, path: &str) -> VfsResult<Stat> {
        let attr = self.mounts.stat(path).await?;
        Ok(Stat::from_attr(&attr, self.config.block_size))
    }

    /// Same as [`stat`](Self::stat); there are no symbolic links.
    pub async fn lstat(&self, path: &str) -> VfsResult<Stat> {
        self.stat(path).await
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.mounts.mkdir(path, mode).await
    }

    pub async fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.mounts.mkdir_all(path, mode).await
    }

    pub async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        self.mounts.readdir(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.mounts.rename(from, to).await
    }

    /// Unlink a non-directory.
    pub async fn remove(&self, path: &str) -> VfsResult<()> {
        let attr = self.mounts.stat(path).await?;
        if attr.is_dir() {
            return Err(VfsError::is_a_directory(path)).op("unlink", path);
        }
        self.mounts.remove(path).await
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let attr = self.mounts.stat(path).await?;
        if !attr.is_dir() {
            return Err(VfsError::not_a_directory(path)).op("rmdir", path);
        }
        self.mounts.remove(path).await
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.mounts.chmod(path, mode).await
    }

    pub async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.mounts.chtimes(path, atime, mtime).await
    }

    /// Total bytes of files at or beneath `path`.
    pub async fn disk_usage(&self, path: &str) -> VfsResult<u64> {
        self.mounts.disk_usage(path).await
    }
}
