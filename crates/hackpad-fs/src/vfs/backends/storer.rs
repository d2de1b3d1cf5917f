//! Record storage: one opaque [`FileRecord`] per canonical path.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::types::{FileAttr, FileMode};

/// The persisted unit: file bytes or a directory's child names, plus mode
/// and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub data: Vec<u8>,
    pub child_names: BTreeSet<String>,
    pub mode: FileMode,
    pub mod_time: SystemTime,
}

impl FileRecord {
    /// A regular file record.
    pub fn file(data: Vec<u8>, perm: u32) -> Self {
        Self {
            data,
            child_names: BTreeSet::new(),
            mode: FileMode::file(perm),
            mod_time: SystemTime::now(),
        }
    }

    /// An empty directory record.
    pub fn directory(perm: u32) -> Self {
        Self {
            data: Vec::new(),
            child_names: BTreeSet::new(),
            mode: FileMode::dir(perm),
            mod_time: SystemTime::now(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr {
            size: self.data.len() as u64,
            mode: self.mode,
            mtime: self.mod_time,
        }
    }

    /// Encode for a byte-oriented store.
    pub fn to_bytes(&self) -> VfsResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from a byte-oriented store.
    pub fn from_bytes(bytes: &[u8]) -> VfsResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Get/set records keyed by canonical path against one physical medium.
///
/// Absence is reported as [`VfsError::NotFound`]. Implementations may be
/// backed by slow or asynchronous I/O.
#[async_trait]
pub trait RecordStorer: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Fetch the record stored at `path`.
    async fn get_record(&self, path: &str) -> VfsResult<FileRecord>;

    /// Store `record` at `path`, or delete it when `None`.
    async fn set_record(&self, path: &str, record: Option<&FileRecord>) -> VfsResult<()>;

    /// Fetch several records. Results line up with `paths`.
    async fn get_records(&self, paths: &[String]) -> Vec<VfsResult<FileRecord>> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push(self.get_record(path).await);
        }
        out
    }
}

/// In-memory record table. All data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorer {
    records: RwLock<HashMap<String, FileRecord>>,
}

impl MemoryStorer {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStorer for MemoryStorer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_record(&self, path: &str) -> VfsResult<FileRecord> {
        self.records
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn set_record(&self, path: &str, record: Option<&FileRecord>) -> VfsResult<()> {
        let mut records = self.records.write();
        match record {
            Some(record) => {
                records.insert(path.to_string(), record.clone());
            }
            None => {
                records.remove(path);
            }
        }
        Ok(())
    }

    async fn get_records(&self, paths: &[String]) -> Vec<VfsResult<FileRecord>> {
        let records = self.records.read();
        paths
            .iter()
            .map(|p| records.get(p).cloned().ok_or_else(|| VfsError::not_found(p.as_str())))
            .collect()
    }
}
