//! Filesystem over a [`RecordStorer`].
//!
//! Directory records hold their children's names; those sets are the only
//! tree index, so structural mutations update the child record and its
//! parent's name set together under one tree lock. Record writes happen in
//! an order where an interrupted mutation leaves at worst an unlinked
//! orphan record, never a name pointing at nothing.
//!
//! Directory rename moves descendants one record at a time. A failure part
//! way through is reported but not rolled back.
//!
//! Open handles never write back a whole snapshot: each write re-reads the
//! current record under the tree lock and replaces only its bytes and
//! modification time.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::storer::{FileRecord, MemoryStorer, RecordStorer};

/// Largest file a handle will grow to.
pub const MAX_FILE_SIZE: u64 = 1 << 30;
use crate::vfs::error::{ResultExt, VfsError, VfsResult};
use crate::vfs::ops::{FileHandle, VfsOps};
use crate::vfs::path::{self, ROOT};
use crate::vfs::types::{FileAttr, OpenFlags};

/// Filesystem that interprets [`FileRecord`]s as files and directories.
pub struct StorerFs {
    storer: Arc<dyn RecordStorer>,
    name: String,
    /// Serializes read-modify-write sequences on records, including those
    /// made by open handles.
    tree: Arc<Mutex<()>>,
}

impl std::fmt::Debug for StorerFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorerFs").field("name", &self.name).finish()
    }
}

impl StorerFs {
    /// Wrap a record store, creating the root directory record if missing.
    pub async fn new(storer: Arc<dyn RecordStorer>) -> VfsResult<Self> {
        match storer.get_record(ROOT).await {
            Ok(root) if root.is_dir() => {}
            Ok(_) => return Err(VfsError::not_a_directory(ROOT)).op("init", ROOT),
            Err(e) if e.is_not_found() => {
                storer
                    .set_record(ROOT, Some(&FileRecord::directory(0o755)))
                    .await
                    .op("init", ROOT)?;
            }
            Err(e) => return Err(e).op("init", ROOT),
        }
        let name = format!("storer({})", storer.name());
        Ok(Self {
            storer,
            name,
            tree: Arc::new(Mutex::new(())),
        })
    }

    /// Filesystem over a fresh in-memory record table.
    pub async fn in_memory() -> VfsResult<Self> {
        Self::new(Arc::new(MemoryStorer::new())).await
    }

    /// The underlying record store.
    pub fn storer(&self) -> &Arc<dyn RecordStorer> {
        &self.storer
    }

    async fn directory(&self, path: &str) -> VfsResult<FileRecord> {
        let record = self.storer.get_record(path).await?;
        if !record.is_dir() {
            return Err(VfsError::not_a_directory(path));
        }
        Ok(record)
    }

    /// Store a new record and link it into its parent.
    async fn link_new(&self, path: &str, record: &FileRecord) -> VfsResult<()> {
        let parent_path = path::parent(path);
        let mut parent = self.directory(parent_path).await?;
        self.storer.set_record(path, Some(record)).await?;
        parent.child_names.insert(path::base_name(path).to_string());
        parent.mod_time = SystemTime::now();
        if let Err(e) = self.storer.set_record(parent_path, Some(&parent)).await {
            let _ = self.storer.set_record(path, None).await;
            return Err(e);
        }
        Ok(())
    }

    async fn mkdir_locked(&self, path: &str, mode: u32) -> VfsResult<()> {
        match self.storer.get_record(path).await {
            Ok(_) => return Err(VfsError::already_exists(path)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.link_new(path, &FileRecord::directory(mode)).await
    }

    async fn open_locked(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<FileRecord> {
        match self.storer.get_record(path).await {
            Ok(record) => {
                if flags.create && flags.exclusive {
                    return Err(VfsError::already_exists(path));
                }
                if record.is_dir() && flags.write {
                    return Err(VfsError::is_a_directory(path));
                }
                Ok(record)
            }
            Err(e) if e.is_not_found() && flags.create => {
                let record = FileRecord::file(Vec::new(), mode);
                self.link_new(path, &record).await?;
                tracing::trace!(path = %path, "created file record");
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_locked(&self, path: &str) -> VfsResult<()> {
        if path == ROOT {
            return Err(VfsError::permission_denied(path));
        }
        let record = self.storer.get_record(path).await?;
        if record.is_dir() && !record.child_names.is_empty() {
            return Err(VfsError::directory_not_empty(path));
        }
        let parent_path = path::parent(path);
        let mut parent = self.directory(parent_path).await?;
        parent.child_names.remove(path::base_name(path));
        parent.mod_time = SystemTime::now();
        self.storer.set_record(parent_path, Some(&parent)).await?;
        self.storer.set_record(path, None).await
    }

    async fn rename_locked(&self, from: &str, to: &str) -> VfsResult<()> {
        if from == ROOT || to == ROOT {
            return Err(VfsError::permission_denied(ROOT));
        }
        if from == to {
            return Ok(());
        }
        if path::is_within(to, from) {
            return Err(VfsError::invalid_input(format!("cannot move {from} beneath itself")));
        }
        let record = self.storer.get_record(from).await?;
        self.directory(path::parent(to)).await?;

        match self.storer.get_record(to).await {
            Ok(existing) => {
                if record.is_dir() {
                    return Err(VfsError::already_exists(to));
                }
                if existing.is_dir() {
                    return Err(VfsError::is_a_directory(to));
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.storer.set_record(to, Some(&record)).await?;
        self.relink(from, to).await?;

        if record.is_dir() {
            let mut pending: Vec<(String, String)> = record
                .child_names
                .iter()
                .map(|name| (path::join(from, name), path::join(to, name)))
                .collect();
            while let Some((old, new)) = pending.pop() {
                let child = self.storer.get_record(&old).await?;
                if child.is_dir() {
                    pending.extend(
                        child
                            .child_names
                            .iter()
                            .map(|name| (path::join(&old, name), path::join(&new, name))),
                    );
                }
                self.storer.set_record(&new, Some(&child)).await?;
                self.storer.set_record(&old, None).await?;
            }
        }

        self.storer.set_record(from, None).await
    }

    /// Move a name from one parent's child set to another's.
    async fn relink(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from_parent, to_parent) = (path::parent(from), path::parent(to));
        let now = SystemTime::now();
        if from_parent == to_parent {
            let mut parent = self.directory(from_parent).await?;
            parent.child_names.remove(path::base_name(from));
            parent.child_names.insert(path::base_name(to).to_string());
            parent.mod_time = now;
            return self.storer.set_record(from_parent, Some(&parent)).await;
        }
        let mut target = self.directory(to_parent).await?;
        target.child_names.insert(path::base_name(to).to_string());
        target.mod_time = now;
        self.storer.set_record(to_parent, Some(&target)).await?;

        let mut source = self.directory(from_parent).await?;
        source.child_names.remove(path::base_name(from));
        source.mod_time = now;
        self.storer.set_record(from_parent, Some(&source)).await
    }

    async fn update<F>(&self, path: &str, change: F) -> VfsResult<()>
    where
        F: FnOnce(&mut FileRecord) + Send,
    {
        let _tree = self.tree.lock().await;
        let mut record = self.storer.get_record(path).await?;
        change(&mut record);
        self.storer.set_record(path, Some(&record)).await
    }
}

#[async_trait]
impl VfsOps for StorerFs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let path = path::normalize(path);
        let record = self.storer.get_record(&path).await.op("stat", &path)?;
        Ok(record.attr())
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        let opened = if flags.create {
            let _tree = self.tree.lock().await;
            self.open_locked(&path, flags, mode).await
        } else {
            self.open_locked(&path, flags, mode).await
        };
        let record = opened.op("open", &path)?;

        let mut file = StorerFile::new(
            Arc::clone(&self.storer),
            Arc::clone(&self.tree),
            path.clone(),
            record,
            flags,
        );
        if flags.truncate && !file.record.is_dir() {
            file.truncate(0).await.op("open", &path)?;
        }
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        let _tree = self.tree.lock().await;
        self.mkdir_locked(&path, mode).await.op("mkdir", &path)
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let path = path::normalize(path);
        let _tree = self.tree.lock().await;
        self.remove_locked(&path).await.op("remove", &path)
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from, to) = (path::normalize(from), path::normalize(to));
        let _tree = self.tree.lock().await;
        self.rename_locked(&from, &to).await.op("rename", &from)
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        self.update(&path, |record| record.mode = record.mode.with_permissions(mode))
            .await
            .op("chmod", &path)
    }

    async fn chtimes(&self, path: &str, _atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let path = path::normalize(path);
        self.update(&path, |record| record.mod_time = mtime)
            .await
            .op("chtimes", &path)
    }

    fn read_only(&self) -> bool {
        false
    }
}

/// Open handle on a record.
///
/// Reads serve the snapshot taken at open (refreshed by this handle's own
/// writes). Writes merge into whatever the store holds now.
pub struct StorerFile {
    storer: Arc<dyn RecordStorer>,
    tree: Arc<Mutex<()>>,
    path: String,
    record: FileRecord,
    flags: OpenFlags,
    offset: u64,
    dir_cursor: usize,
}

impl StorerFile {
    fn new(
        storer: Arc<dyn RecordStorer>,
        tree: Arc<Mutex<()>>,
        path: String,
        record: FileRecord,
        flags: OpenFlags,
    ) -> Self {
        Self {
            storer,
            tree,
            path,
            record,
            flags,
            offset: 0,
            dir_cursor: 0,
        }
    }

    fn check_readable(&self) -> VfsResult<()> {
        if !self.flags.read {
            return Err(VfsError::bad_descriptor(format!("{} not open for reading", self.path)));
        }
        if self.record.is_dir() {
            return Err(VfsError::is_a_directory(self.path.clone()));
        }
        Ok(())
    }

    fn check_writable(&self) -> VfsResult<()> {
        if !self.flags.write {
            return Err(VfsError::bad_descriptor(format!("{} not open for writing", self.path)));
        }
        if self.record.is_dir() {
            return Err(VfsError::is_a_directory(self.path.clone()));
        }
        Ok(())
    }

    /// Change the stored bytes of the current record.
    ///
    /// Mode and times set since open are kept. A record removed since open
    /// is not recreated: the write fails not-found.
    async fn modify<T, F>(&mut self, change: F) -> VfsResult<T>
    where
        F: FnOnce(&mut Vec<u8>) -> VfsResult<T> + Send,
        T: Send,
    {
        let _tree = self.tree.lock().await;
        let mut current = self.storer.get_record(&self.path).await?;
        if current.is_dir() {
            return Err(VfsError::is_a_directory(self.path.clone()));
        }
        let out = change(&mut current.data)?;
        current.mod_time = SystemTime::now();
        self.storer.set_record(&self.path, Some(&current)).await?;
        self.record = current;
        Ok(out)
    }

    fn copy_out(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let len = self.record.data.len() as u64;
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= len {
            return Err(VfsError::EndOfStream);
        }
        let start = offset as usize;
        let n = buf.len().min(self.record.data.len() - start);
        buf[..n].copy_from_slice(&self.record.data[start..start + n]);
        Ok(n)
    }
}

fn check_size(size: u64) -> VfsResult<usize> {
    if size > MAX_FILE_SIZE {
        return Err(VfsError::invalid_input(format!(
            "file size {size} exceeds {MAX_FILE_SIZE} bytes"
        )));
    }
    Ok(size as usize)
}

/// Copy `buf` into `data` at `offset`, zero-filling any gap. Returns the
/// end offset.
fn splice(data: &mut Vec<u8>, offset: u64, buf: &[u8]) -> VfsResult<usize> {
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or_else(|| VfsError::invalid_input(format!("offset {offset} too large")))?;
    let end = check_size(end)?;
    let start = end - buf.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(buf);
    Ok(end)
}

#[async_trait]
impl FileHandle for StorerFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_readable()?;
        let n = self.copy_out(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_readable()?;
        self.copy_out(buf, offset)
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;
        let at = (!self.flags.append).then_some(self.offset);
        let end = self
            .modify(|data| {
                let offset = at.unwrap_or(data.len() as u64);
                splice(data, offset, buf)
            })
            .await?;
        self.offset = end as u64;
        Ok(buf.len())
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_writable()?;
        self.modify(|data| splice(data, offset, buf)).await?;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(n) => self.offset as i128 + n as i128,
            SeekFrom::End(n) => self.record.data.len() as i128 + n as i128,
        };
        if target < 0 {
            return Err(VfsError::invalid_input(format!("seek to negative offset {target}")));
        }
        self.offset = u64::try_from(target)
            .map_err(|_| VfsError::invalid_input(format!("seek to offset {target}")))?;
        Ok(self.offset)
    }

    async fn read_dir(&mut self, count: Option<usize>) -> VfsResult<Vec<String>> {
        if !self.record.is_dir() {
            return Err(VfsError::not_a_directory(self.path.clone()));
        }
        let remaining = self.record.child_names.iter().skip(self.dir_cursor);
        let names: Vec<String> = match count {
            Some(n) if n > 0 => remaining.take(n).cloned().collect(),
            _ => remaining.cloned().collect(),
        };
        if names.is_empty() && matches!(count, Some(n) if n > 0) {
            return Err(VfsError::EndOfStream);
        }
        self.dir_cursor += names.len();
        Ok(names)
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_writable()?;
        let size = check_size(size)?;
        self.modify(|data| {
            data.resize(size, 0);
            Ok(())
        })
        .await
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        // An unlinked handle still reports what it last saw.
        match self.storer.get_record(&self.path).await {
            Ok(current) => Ok(current.attr()),
            Err(e) if e.is_not_found() => Ok(self.record.attr()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::ErrorKind;

    async fn fs() -> StorerFs {
        StorerFs::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_root_exists() {
        let fs = fs().await;
        assert!(fs.stat("/").await.unwrap().is_dir());
        assert!(fs.readdir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let fs = fs().await;
        let err = fs.mkdir("/a/b", 0o755).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/b", 0o700).await.unwrap();
        assert_eq!(fs.stat("/a/b").await.unwrap().perm(), 0o700);
        assert_eq!(fs.readdir("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_mkdir_existing_fails() {
        let fs = fs().await;
        fs.mkdir("/a", 0o755).await.unwrap();
        let err = fs.mkdir("/a", 0o755).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.to_string(), "mkdir /a: already exists: /a");
    }

    #[tokio::test]
    async fn test_mkdir_all() {
        let fs = fs().await;
        fs.mkdir("/usr", 0o755).await.unwrap();
        fs.mkdir_all("/usr/local/go/bin", 0o755).await.unwrap();
        assert!(fs.stat("/usr/local/go/bin").await.unwrap().is_dir());
        assert_eq!(fs.readdir("/usr/local").await.unwrap(), vec!["go"]);

        // Idempotent.
        fs.mkdir_all("/usr/local/go/bin", 0o755).await.unwrap();

        fs.write_all("/usr/file", b"x").await.unwrap();
        let err = fs.mkdir_all("/usr/file/sub", 0o755).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let fs = fs().await;
        let mut file = fs.create("/hello.txt").await.unwrap();
        assert_eq!(file.write(b"hello world").await.unwrap(), 11);
        file.close().await.unwrap();

        assert_eq!(fs.read_all("/hello.txt").await.unwrap(), b"hello world");
        assert_eq!(fs.stat("/hello.txt").await.unwrap().size, 11);
        assert_eq!(fs.readdir("/").await.unwrap(), vec!["hello.txt"]);
    }

    #[tokio::test]
    async fn test_create_requires_parent_directory() {
        let fs = fs().await;
        let err = fs.create("/missing/file").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        fs.write_all("/plain", b"").await.unwrap();
        let err = fs.create("/plain/file").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn test_exclusive_create() {
        let fs = fs().await;
        fs.write_all("/a", b"1").await.unwrap();
        let err = fs
            .open("/a", OpenFlags::create_exclusive(), 0o644)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_open_directory_for_write_fails() {
        let fs = fs().await;
        fs.mkdir("/d", 0o755).await.unwrap();
        let err = fs.open("/d", OpenFlags::write(), 0).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IsADirectory);
    }

    #[tokio::test]
    async fn test_direction_enforced() {
        let fs = fs().await;
        fs.write_all("/f", b"data").await.unwrap();

        let mut ro = fs.open("/f", OpenFlags::read(), 0).await.unwrap();
        let err = ro.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDescriptor);

        let mut wo = fs.open("/f", OpenFlags::write_only(), 0).await.unwrap();
        let mut buf = [0u8; 4];
        let err = wo.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDescriptor);
    }

    #[tokio::test]
    async fn test_truncate_flag() {
        let fs = fs().await;
        fs.write_all("/f", b"old contents").await.unwrap();
        let flags = OpenFlags {
            truncate: true,
            ..OpenFlags::write()
        };
        let mut file = fs.open("/f", flags, 0).await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.stat("/f").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_truncate_grows_with_zeros() {
        let fs = fs().await;
        let mut file = fs.create("/f").await.unwrap();
        file.write(b"ab").await.unwrap();
        file.truncate(5).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size, 5);
        file.truncate(1).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(fs.read_all("/f").await.unwrap(), b"a");

        let mut file = fs.open("/f", OpenFlags::write(), 0).await.unwrap();
        file.truncate(4).await.unwrap();
        assert_eq!(fs.read_all("/f").await.unwrap(), b"a\0\0\0");
    }

    #[tokio::test]
    async fn test_write_at_zero_extends() {
        let fs = fs().await;
        let mut file = fs.create("/f").await.unwrap();
        file.write_at(b"z", 3).await.unwrap();
        assert_eq!(fs.read_all("/f").await.unwrap(), b"\0\0\0z");
    }

    #[tokio::test]
    async fn test_write_past_size_limit_fails() {
        let fs = fs().await;
        let mut file = fs.create("/f").await.unwrap();
        let err = file.write_at(b"xy", u64::MAX).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = file.write_at(b"xy", MAX_FILE_SIZE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = file.truncate(MAX_FILE_SIZE + 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        file.seek(SeekFrom::Start(u64::MAX - 1)).await.unwrap();
        let err = file.write(b"xy").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(fs.stat("/f").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_removed_file_stays_removed_after_close() {
        let fs = fs().await;
        let mut file = fs.create("/f").await.unwrap();
        file.write(b"x").await.unwrap();
        fs.remove("/f").await.unwrap();

        let err = file.write(b"y").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(file.stat().await.unwrap().size, 1);
        file.close().await.unwrap();

        assert!(fs.stat("/f").await.unwrap_err().is_not_found());
        assert!(fs.readdir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_changes_survive_open_handle_writes() {
        let fs = fs().await;
        fs.write_all("/g", b"").await.unwrap();
        let mut file = fs.open("/g", OpenFlags::write(), 0).await.unwrap();

        fs.chmod("/g", 0o600).await.unwrap();
        file.write(b"data").await.unwrap();
        file.close().await.unwrap();
        let attr = fs.stat("/g").await.unwrap();
        assert_eq!(attr.perm(), 0o600);
        assert_eq!(attr.size, 4);

        let mut file = fs.open("/g", OpenFlags::write(), 0).await.unwrap();
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(42);
        fs.chtimes("/g", when, when).await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.stat("/g").await.unwrap().mtime, when);
    }

    #[tokio::test]
    async fn test_writes_from_two_handles_merge() {
        let fs = fs().await;
        fs.write_all("/f", b"....").await.unwrap();
        let mut first = fs.open("/f", OpenFlags::write(), 0).await.unwrap();
        let mut second = fs.open("/f", OpenFlags::write(), 0).await.unwrap();
        first.write_at(b"a", 0).await.unwrap();
        second.write_at(b"b", 3).await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(fs.read_all("/f").await.unwrap(), b"a..b");
    }

    #[tokio::test]
    async fn test_read_at_end_of_stream() {
        let fs = fs().await;
        fs.write_all("/f", b"abc").await.unwrap();
        let mut file = fs.open("/f", OpenFlags::read(), 0).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 1).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        let err = file.read_at(&mut buf, 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndOfStream);
    }

    #[tokio::test]
    async fn test_seek() {
        let fs = fs().await;
        fs.write_all("/f", b"0123456789").await.unwrap();
        let mut file = fs.open("/f", OpenFlags::read(), 0).await.unwrap();

        assert_eq!(file.seek(SeekFrom::End(-3)).await.unwrap(), 7);
        let mut buf = [0u8; 3];
        file.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"789");

        assert_eq!(file.seek(SeekFrom::Current(-5)).await.unwrap(), 5);
        let err = file.seek(SeekFrom::Current(-6)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_append() {
        let fs = fs().await;
        fs.write_all("/log", b"one\n").await.unwrap();
        let flags = OpenFlags {
            append: true,
            ..OpenFlags::write()
        };
        let mut file = fs.open("/log", flags, 0).await.unwrap();
        file.write(b"two\n").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.read_all("/log").await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_read_dir_cursor() {
        let fs = fs().await;
        for name in ["c", "a", "b"] {
            fs.write_all(&format!("/{name}"), b"").await.unwrap();
        }
        let mut dir = fs.open("/", OpenFlags::read(), 0).await.unwrap();
        assert_eq!(dir.read_dir(Some(2)).await.unwrap(), vec!["a", "b"]);
        assert_eq!(dir.read_dir(Some(2)).await.unwrap(), vec!["c"]);
        let err = dir.read_dir(Some(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndOfStream);
        assert!(dir.read_dir(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let fs = fs().await;
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.write_all("/d/f", b"x").await.unwrap();

        let err = fs.remove("/d").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DirectoryNotEmpty);

        fs.remove("/d/f").await.unwrap();
        fs.remove("/d").await.unwrap();
        assert!(fs.stat("/d").await.unwrap_err().is_not_found());
        assert!(fs.readdir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_all_not_implemented() {
        let fs = fs().await;
        let err = fs.remove_all("/").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn test_rename_file() {
        let fs = fs().await;
        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/b", 0o755).await.unwrap();
        fs.write_all("/a/f", b"payload").await.unwrap();

        fs.rename("/a/f", "/a/g").await.unwrap();
        assert_eq!(fs.readdir("/a").await.unwrap(), vec!["g"]);

        fs.rename("/a/g", "/b/h").await.unwrap();
        assert!(fs.readdir("/a").await.unwrap().is_empty());
        assert_eq!(fs.readdir("/b").await.unwrap(), vec!["h"]);
        assert_eq!(fs.read_all("/b/h").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_rename_file_over_file() {
        let fs = fs().await;
        fs.write_all("/x", b"new").await.unwrap();
        fs.write_all("/y", b"old").await.unwrap();
        fs.rename("/x", "/y").await.unwrap();
        assert_eq!(fs.readdir("/").await.unwrap(), vec!["y"]);
        assert_eq!(fs.read_all("/y").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_rename_directory_moves_descendants() {
        let fs = fs().await;
        fs.mkdir_all("/src/pkg/inner", 0o755).await.unwrap();
        fs.write_all("/src/pkg/inner/f.go", b"package inner").await.unwrap();
        fs.write_all("/src/top.go", b"package src").await.unwrap();

        fs.rename("/src", "/dst").await.unwrap();

        assert!(fs.stat("/src").await.unwrap_err().is_not_found());
        assert!(fs.stat("/src/pkg/inner/f.go").await.unwrap_err().is_not_found());
        assert_eq!(fs.readdir("/").await.unwrap(), vec!["dst"]);
        assert_eq!(fs.readdir("/dst").await.unwrap(), vec!["pkg", "top.go"]);
        assert_eq!(
            fs.read_all("/dst/pkg/inner/f.go").await.unwrap(),
            b"package inner"
        );
    }

    #[tokio::test]
    async fn test_rename_directory_destination_must_not_exist() {
        let fs = fs().await;
        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/b", 0o755).await.unwrap();
        let err = fs.rename("/a", "/b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = fs.rename("/a", "/a/inside").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_chmod_and_chtimes() {
        let fs = fs().await;
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.chmod("/d", 0o1700).await.unwrap();
        let attr = fs.stat("/d").await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.mode.bits() & 0o7777, 0o1700);

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(42);
        fs.chtimes("/d", when, when).await.unwrap();
        assert_eq!(fs.stat("/d").await.unwrap().mtime, when);

        let err = fs.chmod("/missing", 0o644).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_persists_through_storer() {
        let storer: Arc<dyn RecordStorer> = Arc::new(MemoryStorer::new());
        {
            let fs = StorerFs::new(Arc::clone(&storer)).await.unwrap();
            fs.mkdir("/keep", 0o755).await.unwrap();
            fs.write_all("/keep/f", b"kept").await.unwrap();
        }
        let fs = StorerFs::new(storer).await.unwrap();
        assert_eq!(fs.read_all("/keep/f").await.unwrap(), b"kept");
    }
}
