//! VFS operations traits.
//!
//! [`VfsOps`] is the capability set every backend, cache layer and the mount
//! table implement. [`FileHandle`] is the cursor state returned by `open`.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::time::SystemTime;

use super::error::{ErrorKind, ResultExt, VfsError, VfsResult};
use super::path;
use super::types::{FileAttr, OpenFlags};

/// Chunk size used by convenience copies.
pub(crate) const COPY_CHUNK: usize = 32 * 1024;

/// An open file or directory.
///
/// Reads past the end report [`VfsError::EndOfStream`]; callers that want
/// POSIX "zero bytes at EOF" semantics translate it.
#[async_trait]
pub trait FileHandle: Send + Sync {
    /// Canonical path the handle was opened with, as seen by its backend.
    fn path(&self) -> &str;

    /// Read at the cursor, advancing it.
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Read at an absolute offset without moving the cursor.
    async fn read_at(&mut self, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::not_implemented("read_at"))
    }

    /// Write at the cursor, advancing it.
    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize>;

    /// Write at an absolute offset without moving the cursor.
    async fn write_at(&mut self, _buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::not_implemented("write_at"))
    }

    /// Move the cursor, returning the new absolute offset.
    async fn seek(&mut self, _pos: SeekFrom) -> VfsResult<u64> {
        Err(VfsError::not_implemented("seek"))
    }

    /// Read directory entry names in sorted order.
    ///
    /// `Some(n)` returns at most `n` names and advances the directory cursor,
    /// failing with end-of-stream once nothing is left. `None` returns every
    /// remaining name.
    async fn read_dir(&mut self, _count: Option<usize>) -> VfsResult<Vec<String>> {
        Err(VfsError::not_a_directory(self.path().to_string()))
    }

    /// Resize the file, zero-filling when growing.
    async fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        Err(VfsError::not_implemented("truncate"))
    }

    /// Current attributes.
    async fn stat(&mut self) -> VfsResult<FileAttr>;

    /// Flush pending state to the backing store.
    async fn sync(&mut self) -> VfsResult<()> {
        Ok(())
    }

    /// Release the handle.
    async fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}

/// Core VFS operations trait.
///
/// All operations are path-based. Backends receive canonical absolute paths
/// rooted at their own `/`; the MountTable handles routing and prefix
/// stripping.
#[async_trait]
pub trait VfsOps: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &str;

    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn stat(&self, path: &str) -> VfsResult<FileAttr>;

    /// Open a file or directory.
    ///
    /// `mode` supplies permission bits when `flags.create` makes a new file.
    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn FileHandle>>;

    /// List directory entry names, sorted.
    async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        let mut handle = self.open(path, OpenFlags::read(), 0).await?;
        let names = handle.read_dir(None).await;
        handle.close().await?;
        names.op("readdir", path)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create (or truncate) a file for reading and writing.
    async fn create(&self, path: &str) -> VfsResult<Box<dyn FileHandle>> {
        self.open(path, OpenFlags::create_truncate(), 0o666).await
    }

    /// Create a directory. The parent must already exist.
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Create a directory and any missing ancestors.
    ///
    /// Fails with not-a-directory when a non-directory sits in the chain.
    async fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        let target = path::normalize(path);
        let mut missing = Vec::new();
        let mut current = target.clone();
        loop {
            match self.stat(&current).await {
                Ok(attr) if attr.is_dir() => break,
                Ok(_) => {
                    return Err(VfsError::not_a_directory(current.clone())).op("mkdir_all", &current);
                }
                Err(e) if e.is_not_found() && current != path::ROOT => {
                    let up = path::parent(&current).to_string();
                    missing.push(std::mem::replace(&mut current, up));
                }
                Err(e) => return Err(e).op("mkdir_all", &current),
            }
        }
        for dir in missing.iter().rev() {
            match self.mkdir(dir, mode).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).op("mkdir_all", dir),
            }
        }
        Ok(())
    }

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Remove a path and everything beneath it.
    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        Err(VfsError::not_implemented("remove_all")).op("remove_all", path)
    }

    /// Rename a file or directory.
    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Change permission, setuid, setgid and sticky bits.
    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Change timestamps. Only the modification time is stored.
    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns true if this filesystem is read-only.
    fn read_only(&self) -> bool;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut handle = self.open(path, OpenFlags::read(), 0).await?;
        let mut out = Vec::new();
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            match handle.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::EndOfStream => break,
                Err(e) => {
                    let _ = handle.close().await;
                    return Err(e).op("read", path);
                }
            }
        }
        handle.close().await?;
        Ok(out)
    }

    /// Write entire file contents, creating or truncating the file.
    async fn write_all(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let mut handle = self.create(path).await?;
        let written = handle.write_at(data, 0).await;
        let closed = handle.close().await;
        written.op("write", path)?;
        closed
    }
}
