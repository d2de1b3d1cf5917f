//! # hackpad-fs
//!
//! In-process virtual filesystem for sandboxed processes.
//!
//! A single [`FsContext`] is shared by every process in the sandbox. It owns:
//! - A mount table routing paths to backends (record stores, `.tar.gz` archives)
//! - Cache layers that can be stacked in front of slow backends
//! - A descriptor table with per-process open counts, pipes and advisory locks

pub mod cache;
pub mod config;
pub mod context;
pub mod fd;
pub mod vfs;

pub use cache::{ArtifactCache, PathPredicate, ReadThroughCache, StatCache};
pub use config::{ConfigError, FsConfig};
pub use context::FsContext;
pub use fd::{
    FdTable, Fid, LockCoordinator, LockKind, MemoryLockCoordinator, MemorySink, OutputSink, Pid,
    Pipe, StdStream, TracingSink,
};
pub use vfs::{
    ArchiveFs, ErrorKind, FileAttr, FileHandle, FileMode, FileRecord, FileType, MemoryStorer,
    MountInfo, MountTable, OpenFlags, RecordStorer, SqliteStorer, Stat, StorerFs, VfsError, VfsOps,
    VfsResult,
};
