//! Read-only filesystem materialized from a gzip-compressed tar stream.
//!
//! Construction returns immediately; decoding runs on a blocking task and
//! fills the file and directory tables as entries arrive. Lookups of paths
//! already in the tables answer at once. Everything else waits on a
//! one-shot completion signal and then replays any decode error.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::vfs::error::{ResultExt, VfsError, VfsResult};
use crate::vfs::ops::{FileHandle, VfsOps};
use crate::vfs::path::{self, ROOT};
use crate::vfs::types::{FileAttr, FileMode, OpenFlags};

const DIR_PERM: u32 = 0o755;

#[derive(Debug)]
struct ArchiveEntry {
    data: Arc<[u8]>,
    mode: u32,
    mtime: SystemTime,
}

#[derive(Debug)]
struct Tables {
    files: HashMap<String, ArchiveEntry>,
    /// Directory path to child names. Implied parents are included.
    dirs: HashMap<String, BTreeSet<String>>,
    error: Option<VfsError>,
    started: SystemTime,
}

impl Tables {
    fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(ROOT.to_string(), BTreeSet::new());
        Self {
            files: HashMap::new(),
            dirs,
            error: None,
            started: SystemTime::now(),
        }
    }

    fn add_dir(&mut self, dir: &str) {
        let mut current = dir.to_string();
        while current != ROOT {
            let parent = path::parent(&current).to_string();
            self.dirs.entry(current.clone()).or_default();
            let inserted = self
                .dirs
                .entry(parent.clone())
                .or_default()
                .insert(path::base_name(&current).to_string());
            if !inserted {
                break;
            }
            current = parent;
        }
    }

    fn add_file(&mut self, file: &str, entry: ArchiveEntry) {
        self.add_dir(path::parent(file));
        self.dirs
            .entry(path::parent(file).to_string())
            .or_default()
            .insert(path::base_name(file).to_string());
        self.files.insert(file.to_string(), entry);
    }

    fn attr(&self, path: &str) -> Option<FileAttr> {
        if let Some(entry) = self.files.get(path) {
            return Some(FileAttr {
                size: entry.data.len() as u64,
                mode: FileMode::file(entry.mode),
                mtime: entry.mtime,
            });
        }
        self.dirs
            .contains_key(path)
            .then(|| FileAttr::directory(DIR_PERM).with_mtime(self.started))
    }
}

/// Read-only archive-backed filesystem.
pub struct ArchiveFs {
    tables: Arc<RwLock<Tables>>,
    ready: watch::Receiver<bool>,
}

impl std::fmt::Debug for ArchiveFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFs")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ArchiveFs {
    /// Start materializing a `.tar.gz` stream. Must be called inside a Tokio
    /// runtime.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let tables = Arc::new(RwLock::new(Tables::new()));
        let (done, ready) = watch::channel(false);

        let shared = Arc::clone(&tables);
        tokio::task::spawn_blocking(move || {
            let result = materialize(reader, &shared);
            let mut tables = shared.write();
            match result {
                Ok(count) => {
                    tracing::info!(
                        entries = count,
                        files = tables.files.len(),
                        dirs = tables.dirs.len(),
                        "archive materialized"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "archive materialization failed");
                    tables.error = Some(e);
                }
            }
            drop(tables);
            let _ = done.send(true);
        });

        Self { tables, ready }
    }

    /// Start materializing an in-memory `.tar.gz` blob.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_reader(std::io::Cursor::new(bytes))
    }

    /// True once materialization has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for materialization, returning its error if it failed.
    pub async fn wait(&self) -> VfsResult<()> {
        let mut ready = self.ready.clone();
        if ready.wait_for(|done| *done).await.is_err() {
            return Err(VfsError::storage("archive materialization aborted"));
        }
        match &self.tables.read().error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Attributes for `path` if it is already known.
    fn known(&self, path: &str) -> Option<FileAttr> {
        self.tables.read().attr(path)
    }

    async fn resolve(&self, path: &str) -> VfsResult<FileAttr> {
        if let Some(attr) = self.known(path) {
            return Ok(attr);
        }
        self.wait().await?;
        self.known(path).ok_or_else(|| VfsError::not_found(path))
    }

    fn snapshot(&self, path: &str, attr: FileAttr) -> VfsResult<ArchiveFile> {
        let tables = self.tables.read();
        let node = if attr.is_dir() {
            let names = tables
                .dirs
                .get(path)
                .map(|names| names.iter().cloned().collect())
                .unwrap_or_default();
            Node::Dir(names)
        } else {
            let entry = tables
                .files
                .get(path)
                .ok_or_else(|| VfsError::not_found(path))?;
            Node::File(Arc::clone(&entry.data))
        };
        Ok(ArchiveFile {
            path: path.to_string(),
            attr,
            node,
            offset: 0,
            dir_cursor: 0,
        })
    }
}

fn materialize<R: Read>(reader: R, tables: &RwLock<Tables>) -> VfsResult<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = path::normalize(&entry.path()?.to_string_lossy());
        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode().unwrap_or(0o644);
        let mtime = header
            .mtime()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or(UNIX_EPOCH);

        match kind {
            tar::EntryType::Directory => {
                tables.write().add_dir(&name);
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                tables.write().add_file(
                    &name,
                    ArchiveEntry {
                        data: data.into(),
                        mode,
                        mtime,
                    },
                );
            }
            other => {
                tracing::debug!(path = %name, kind = ?other, "skipping archive entry");
                continue;
            }
        }
        count += 1;
    }
    Ok(count)
}

#[async_trait]
impl VfsOps for ArchiveFs {
    fn name(&self) -> &str {
        "archive"
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let path = path::normalize(path);
        self.resolve(&path).await.op("stat", &path)
    }

    async fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        if !flags.is_read_only() {
            return Err(VfsError::ReadOnly).op("open", &path);
        }
        let attr = self.resolve(&path).await.op("open", &path)?;
        if attr.is_dir() {
            // A directory's listing is only complete once decoding ends.
            self.wait().await.op("open", &path)?;
        }
        let file = self.snapshot(&path, attr).op("open", &path)?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("mkdir", path)
    }

    async fn mkdir_all(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("mkdir_all", path)
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("remove", path)
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("remove_all", path)
    }

    async fn rename(&self, from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("rename", from)
    }

    async fn chmod(&self, path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("chmod", path)
    }

    async fn chtimes(&self, path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::ReadOnly).op("chtimes", path)
    }

    fn read_only(&self) -> bool {
        true
    }
}

enum Node {
    File(Arc<[u8]>),
    Dir(Vec<String>),
}

/// Handle on an archive entry.
pub struct ArchiveFile {
    path: String,
    attr: FileAttr,
    node: Node,
    offset: u64,
    dir_cursor: usize,
}

impl ArchiveFile {
    fn data(&self) -> VfsResult<&[u8]> {
        match &self.node {
            Node::File(data) => Ok(&data[..]),
            Node::Dir(_) => Err(VfsError::is_a_directory(self.path.clone())),
        }
    }

    fn copy_out(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let data = self.data()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= data.len() as u64 {
            return Err(VfsError::EndOfStream);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

#[async_trait]
impl FileHandle for ArchiveFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let n = self.copy_out(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.copy_out(buf, offset)
    }

    async fn write(&mut self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::ReadOnly)
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let len = self.data()?.len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(n) => self.offset as i128 + n as i128,
            SeekFrom::End(n) => len + n as i128,
        };
        if target < 0 {
            return Err(VfsError::invalid_input(format!("seek to negative offset {target}")));
        }
        self.offset = target as u64;
        Ok(self.offset)
    }

    async fn read_dir(&mut self, count: Option<usize>) -> VfsResult<Vec<String>> {
        let Node::Dir(names) = &self.node else {
            return Err(VfsError::not_a_directory(self.path.clone()));
        };
        let remaining = &names[self.dir_cursor.min(names.len())..];
        let take = match count {
            Some(n) if n > 0 => {
                if remaining.is_empty() {
                    return Err(VfsError::EndOfStream);
                }
                n.min(remaining.len())
            }
            _ => remaining.len(),
        };
        let out = remaining[..take].to_vec();
        self.dir_cursor += take;
        Ok(out)
    }

    async fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        Ok(self.attr.clone())
    }
}
