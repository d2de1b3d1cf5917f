//! Filesystem backends.

mod archive;
mod sqlite;
mod storer;
mod storer_fs;

pub use archive::{ArchiveFile, ArchiveFs};
pub use sqlite::SqliteStorer;
pub use storer::{FileRecord, MemoryStorer, RecordStorer};
pub use storer_fs::{StorerFile, StorerFs, MAX_FILE_SIZE};

#[cfg(test)]
pub(crate) use archive::tests::tar_gz;
