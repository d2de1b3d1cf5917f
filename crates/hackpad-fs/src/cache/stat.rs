//! Metadata cache: memoized `stat` and `readdir`.
//!
//! Invalidation is conservative. Any mutation drops the touched paths, their
//! parents' listings and (for remove/rename) everything cached beneath them.
//! Handles opened for writing drop their path on every write and on close.
//! Population carries an epoch so a result fetched before a concurrent
//! invalidation is never stored after it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use super::PathPredicate;
use crate::vfs::path;
use crate::vfs::{FileAttr, FileHandle, OpenFlags, VfsOps, VfsResult};

#[derive(Debug, Default)]
struct Entries {
    epoch: u64,
    info: HashMap<String, FileAttr>,
    listings: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<Entries>,
}

impl Shared {
    fn epoch(&self) -> u64 {
        self.entries.lock().epoch
    }

    fn invalidate(&self, paths: &[&str]) {
        let mut entries = self.entries.lock();
        entries.epoch += 1;
        for path in paths {
            entries.info.remove(*path);
            entries.listings.remove(*path);
        }
    }

    fn invalidate_tree(&self, root: &str) {
        let mut entries = self.entries.lock();
        entries.epoch += 1;
        entries.info.retain(|p, _| !path::is_within(p, root));
        entries.listings.retain(|p, _| !path::is_within(p, root));
    }
}

/// Memoizes `stat` and `readdir` of an inner filesystem.
pub struct StatCache {
    inner: Arc<dyn VfsOps>,
    predicate: PathPredicate,
    shared: Arc<Shared>,
    name: String,
}

impl std::fmt::Debug for StatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCache")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl StatCache {
    pub fn new(inner: Arc<dyn VfsOps>, predicate: PathPredicate) -> Self {
        let name = format!("stat-cache({})", inner.name());
        Self {
            inner,
            predicate,
            shared: Arc::new(Shared::default()),
            name,
        }
    }

    /// Number of memoized `stat` results.
    pub fn cached_stats(&self) -> usize {
        self.shared.entries.lock().info.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut entries = self.shared.entries.lock();
        entries.epoch += 1;
        entries.info.clear();
        entries.listings.clear();
    }

    fn with_parent(path: &str) -> [&str; 2] {
        [path, path::parent(path)]
    }
}

#[async_trait]
impl VfsOps for StatCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let path = path::normalize(path);
        if !self.predicate.matches(&path) {
            return self.inner.stat(&path).await;
        }
        let epoch = {
            let entries = self.shared.entries.lock();
            if let Some(attr) = entries.info.get(&path) {
                return Ok(attr.clone());
            }
            entries.epoch
        };
        let attr = self.inner.stat(&path).await?;
        let mut entries = self.shared.entries.lock();
        if entries.epoch == epoch {
            entries.info.insert(path, attr.clone());
        }
        Ok(attr)
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        let path = path::normalize(path);
        if !self.predicate.matches(&path) {
            return self.inner.readdir(&path).await;
        }
        let epoch = {
            let entries = self.shared.entries.lock();
            if let Some(names) = entries.listings.get(&path) {
                return Ok(names.clone());
            }
            entries.epoch
        };
        let names = self.inner.readdir(&path).await?;
        let mut entries = self.shared.entries.lock();
        if entries.epoch == epoch {
            entries.listings.insert(path, names.clone());
        }
        Ok(names)
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        if flags.is_read_only() {
            return self.inner.open(&path, flags, mode).await;
        }
        self.shared.invalidate(&Self::with_parent(&path));
        let result = self.inner.open(&path, flags, mode).await;
        self.shared.invalidate(&Self::with_parent(&path));
        let inner = result?;
        Ok(Box::new(InvalidatingFile {
            inner,
            path,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        self.shared.invalidate(&Self::with_parent(&path));
        let result = self.inner.mkdir(&path, mode).await;
        self.shared.invalidate(&Self::with_parent(&path));
        result
    }

    async fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        let result = self.inner.mkdir_all(&path, mode).await;
        // Any ancestor may have been created.
        self.clear();
        result
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let path = path::normalize(path);
        self.shared.invalidate_tree(&path);
        self.shared.invalidate(&[path::parent(&path)]);
        let result = self.inner.remove(&path).await;
        self.shared.invalidate_tree(&path);
        self.shared.invalidate(&[path::parent(&path)]);
        result
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let path = path::normalize(path);
        let result = self.inner.remove_all(&path).await;
        self.shared.invalidate_tree(&path);
        self.shared.invalidate(&[path::parent(&path)]);
        result
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from, to) = (path::normalize(from), path::normalize(to));
        let drop_all = |shared: &Shared| {
            shared.invalidate_tree(&from);
            shared.invalidate_tree(&to);
            shared.invalidate(&[path::parent(&from), path::parent(&to)]);
        };
        drop_all(&self.shared);
        let result = self.inner.rename(&from, &to).await;
        drop_all(&self.shared);
        result
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        self.shared.invalidate(&[&path]);
        let result = self.inner.chmod(&path, mode).await;
        self.shared.invalidate(&[&path]);
        result
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let path = path::normalize(path);
        self.shared.invalidate(&[&path]);
        let result = self.inner.chtimes(&path, atime, mtime).await;
        self.shared.invalidate(&[&path]);
        result
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }
}

/// Write-capable handle that keeps the metadata cache honest.
struct InvalidatingFile {
    inner: Box<dyn FileHandle>,
    path: String,
    shared: Arc<Shared>,
}

impl InvalidatingFile {
    fn touch(&self) {
        self.shared.invalidate(&[&self.path]);
    }
}

#[async_trait]
impl FileHandle for InvalidatingFile {
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.inner.read(buf).await
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.inner.read_at(buf, offset).await
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        let result = self.inner.write(buf).await;
        self.touch();
        result
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let result = self.inner.write_at(buf, offset).await;
        self.touch();
        result
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.inner.seek(pos).await
    }

    async fn read_dir(&mut self, count: Option<usize>) -> VfsResult<Vec<String>> {
        self.inner.read_dir(count).await
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        let result = self.inner.truncate(size).await;
        self.touch();
        result
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.inner.stat().await
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.inner.sync().await
    }

    async fn close(&mut self) -> VfsResult<()> {
        let result = self.inner.close().await;
        self.touch();
        result
    }
}
