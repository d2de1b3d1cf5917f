//! Virtual Filesystem abstraction.
//!
//! This module provides a path-based VFS that many logical processes share.
//! Key components:
//!
//! - [`VfsOps`] - Core trait for filesystem operations
//! - [`FileHandle`] - Cursor state returned by `open`
//! - [`MountTable`] - Routes operations to backends based on path
//! - [`StorerFs`] - Filesystem over a [`RecordStorer`] (memory, SQLite)
//! - [`ArchiveFs`] - Read-only filesystem decoded from a `.tar.gz`
//!
//! ## Design Decisions
//!
//! - **Canonical string paths**: every key is absolute and cleaned by
//!   [`path::normalize`] before it reaches a backend or a cache.
//! - **Longest-prefix routing**: MountTable routes to the most specific
//!   mount point that matches and strips the prefix, so a backend only ever
//!   sees paths inside its own subtree.
//! - **Record-oriented storage**: directory records carry their children's
//!   names; there is no separate index.

pub mod backends;
mod error;
mod mount;
mod ops;
pub mod path;
mod types;

pub use backends::{ArchiveFs, FileRecord, MemoryStorer, RecordStorer, SqliteStorer, StorerFs};
pub use error::{ErrorKind, ResultExt, VfsError, VfsResult};
pub use mount::{MountInfo, MountTable};
pub(crate) use mount::copy_handle;
pub use ops::{FileHandle, VfsOps};
pub use types::{FileAttr, FileMode, FileType, OpenFlags, Stat};
pub use types::{PERM_MASK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFMT, S_IFREG, S_ISGID, S_ISUID, S_ISVTX};
