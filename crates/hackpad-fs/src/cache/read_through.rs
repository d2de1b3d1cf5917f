//! Read-through object cache.
//!
//! Opening a file for reading serves it from the cache store, copying it
//! from the base on the first open. Metadata always comes from the base.
//! Every mutation is rejected.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use crate::vfs::path::{self, ROOT};
use crate::vfs::{
    copy_handle, ErrorKind, FileAttr, FileHandle, OpenFlags, ResultExt, VfsError, VfsOps, VfsResult,
};

/// Lazily promotes files from a slow read-only `base` into a fast `cache`.
pub struct ReadThroughCache {
    base: Arc<dyn VfsOps>,
    cache: Arc<dyn VfsOps>,
    name: String,
    /// Per-path population locks.
    populating: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache").field("name", &self.name).finish()
    }
}

impl ReadThroughCache {
    pub fn new(base: Arc<dyn VfsOps>, cache: Arc<dyn VfsOps>) -> Self {
        let name = format!("read-through({} -> {})", base.name(), cache.name());
        Self {
            base,
            cache,
            name,
            populating: DashMap::new(),
        }
    }

    async fn cached_file(&self, path: &str) -> VfsResult<bool> {
        match self.cache.stat(path).await {
            Ok(attr) => Ok(!attr.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy `path` from base into cache, creating missing parent
    /// directories with the base's permissions.
    async fn populate(&self, path: &str, attr: &FileAttr) -> VfsResult<()> {
        let mut missing = Vec::new();
        let mut dir = path::parent(path).to_string();
        while dir != ROOT {
            match self.cache.stat(&dir).await {
                Ok(_) => break,
                Err(e) if e.is_not_found() => {
                    let up = path::parent(&dir).to_string();
                    missing.push(std::mem::replace(&mut dir, up));
                }
                Err(e) => return Err(e),
            }
        }
        for dir in missing.iter().rev() {
            let perm = self.base.stat(dir).await?.perm();
            match self.cache.mkdir(dir, perm).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }

        let mut src = self.base.open(path, OpenFlags::read(), 0).await?;
        let mut dst = match self.cache.open(path, OpenFlags::create_truncate(), attr.perm()).await {
            Ok(dst) => dst,
            Err(e) => {
                let _ = src.close().await;
                return Err(e);
            }
        };
        let copied = copy_handle(src.as_mut(), dst.as_mut()).await;
        let src_closed = src.close().await;
        let dst_closed = dst.close().await;
        let outcome = copied.and_then(|bytes| src_closed.and(dst_closed).map(|_| bytes));
        match outcome {
            Ok(bytes) => {
                tracing::debug!(path = %path, bytes, "promoted into cache");
                Ok(())
            }
            Err(e) => {
                // Never leave a partial copy that later opens would trust.
                let _ = self.cache.remove(path).await;
                Err(e)
            }
        }
    }

    /// Make sure `path` is in the cache. Directories are not promoted; their
    /// base handle is returned instead.
    async fn promote(&self, path: &str) -> VfsResult<Option<Box<dyn FileHandle>>> {
        if self.cached_file(path).await? {
            return Ok(None);
        }
        let attr = self.base.stat(path).await?;
        if attr.is_dir() {
            return self.base.open(path, OpenFlags::read(), 0).await.map(Some);
        }
        self.populate(path, &attr).await?;
        Ok(None)
    }

    async fn open_cached(&self, path: &str) -> VfsResult<Box<dyn FileHandle>> {
        // A cache copy only counts once no population of it is in flight.
        let ready = self.cached_file(path).await? && !self.populating.contains_key(path);
        if !ready {
            let lock = Arc::clone(self.populating.entry(path.to_string()).or_default().value());
            let promoted = {
                let _guard = lock.lock().await;
                self.promote(path).await
            };
            self.populating.remove(path);
            if let Some(dir) = promoted? {
                return Ok(dir);
            }
        }
        let inner = self.cache.open(path, OpenFlags::read(), 0).await?;
        Ok(Box::new(ReadThroughFile {
            inner,
            base: Arc::clone(&self.base),
        }))
    }
}

#[async_trait]
impl VfsOps for ReadThroughCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        self.base.stat(path).await
    }

    async fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        if !flags.is_read_only() {
            return Err(VfsError::permission_denied(path.clone())).op("open", &path);
        }
        self.open_cached(&path).await.op("open", &path)
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        self.base.readdir(path).await
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("mkdir", path)
    }

    async fn mkdir_all(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("mkdir_all", path)
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("remove", path)
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("remove_all", path)
    }

    async fn rename(&self, from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::permission_denied(from)).op("rename", from)
    }

    async fn chmod(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("chmod", path)
    }

    async fn chtimes(&self, path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::permission_denied(path)).op("chtimes", path)
    }

    fn read_only(&self) -> bool {
        true
    }
}

/// Reads from the cache copy; reports the base's metadata.
struct ReadThroughFile {
    inner: Box<dyn FileHandle>,
    base: Arc<dyn VfsOps>,
}

#[async_trait]
impl FileHandle for ReadThroughFile {
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.inner.read(buf).await
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.inner.read_at(buf, offset).await
    }

    async fn write(&mut self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::permission_denied(self.inner.path().to_string()))
    }

    async fn write_at(&mut self, _buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::permission_denied(self.inner.path().to_string()))
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.inner.seek(pos).await
    }

    async fn read_dir(&mut self, _count: Option<usize>) -> VfsResult<Vec<String>> {
        Err(VfsError::not_a_directory(self.inner.path().to_string()))
    }

    async fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        Err(VfsError::permission_denied(self.inner.path().to_string()))
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        let path = self.inner.path().to_string();
        self.base.stat(&path).await
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.inner.close().await
    }
}
