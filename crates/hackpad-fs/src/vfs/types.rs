//! Core VFS types.
//!
//! Modes use POSIX `st_mode` bit layout so they can be handed to the host
//! bridge unchanged.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Named pipe.
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Set-user-ID.
pub const S_ISUID: u32 = 0o4000;
/// Set-group-ID.
pub const S_ISGID: u32 = 0o2000;
/// Sticky bit.
pub const S_ISVTX: u32 = 0o1000;
/// Permission bits.
pub const PERM_MASK: u32 = 0o777;

/// Bits that `chmod` may change.
const CHMOD_MASK: u32 = PERM_MASK | S_ISUID | S_ISGID | S_ISVTX;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Named pipe.
    NamedPipe,
    /// Character device.
    CharDevice,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    fn type_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::NamedPipe => S_IFIFO,
            FileType::CharDevice => S_IFCHR,
        }
    }
}

/// File mode: type bits plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMode(u32);

impl FileMode {
    /// Build a mode from a file type and permission bits.
    pub fn new(kind: FileType, perm: u32) -> Self {
        Self(kind.type_bits() | (perm & CHMOD_MASK))
    }

    /// Regular file mode.
    pub fn file(perm: u32) -> Self {
        Self::new(FileType::File, perm)
    }

    /// Directory mode.
    pub fn dir(perm: u32) -> Self {
        Self::new(FileType::Directory, perm)
    }

    /// Wrap raw `st_mode` bits. Missing type bits mean a regular file.
    pub fn from_bits(bits: u32) -> Self {
        if bits & S_IFMT == 0 {
            Self(bits | S_IFREG)
        } else {
            Self(bits)
        }
    }

    /// Raw `st_mode` bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.0 & PERM_MASK
    }

    pub fn kind(&self) -> FileType {
        match self.0 & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFIFO => FileType::NamedPipe,
            S_IFCHR => FileType::CharDevice,
            _ => FileType::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.0 & S_IFMT == S_IFDIR
    }

    /// Replace the chmod-able bits, keeping the file type.
    pub fn with_permissions(self, mode: u32) -> Self {
        Self((self.0 & !CHMOD_MASK) | (mode & CHMOD_MASK))
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// Type and permission bits.
    pub mode: FileMode,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl FileAttr {
    /// Create attributes for a new file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            mode: FileMode::file(perm),
            mtime: SystemTime::now(),
        }
    }

    /// Create attributes for a new directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            size: 0,
            mode: FileMode::dir(perm),
            mtime: SystemTime::now(),
        }
    }

    /// Set the modification time.
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn kind(&self) -> FileType {
        self.mode.kind()
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind().is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn perm(&self) -> u32 {
        self.mode.perm()
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    pub const O_RDONLY: i32 = 0o0;
    pub const O_WRONLY: i32 = 0o1;
    pub const O_RDWR: i32 = 0o2;
    pub const O_ACCMODE: i32 = 0o3;
    pub const O_CREAT: i32 = 0o100;
    pub const O_EXCL: i32 = 0o200;
    pub const O_TRUNC: i32 = 0o1000;
    pub const O_APPEND: i32 = 0o2000;

    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Write access without read.
    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }

    /// Decode Linux `open(2)` flag bits as passed by the host bridge.
    pub fn from_posix(flags: i32) -> Self {
        let (read, write) = match flags & Self::O_ACCMODE {
            Self::O_WRONLY => (false, true),
            Self::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            append: flags & Self::O_APPEND != 0,
            create: flags & Self::O_CREAT != 0,
            truncate: flags & Self::O_TRUNC != 0,
            exclusive: flags & Self::O_EXCL != 0,
        }
    }

    /// True when the open cannot change the file's contents or existence.
    pub fn is_read_only(&self) -> bool {
        !(self.write || self.append || self.create || self.truncate)
    }
}

/// POSIX `stat` record as reported to callers.
///
/// There is no device or inode identity, so `dev`, `ino` and `rdev` are
/// always zero and every timestamp equals the modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    /// Milliseconds since the Unix epoch.
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
}

impl Stat {
    /// Derive a stat record from attributes using a nominal block size.
    pub fn from_attr(attr: &FileAttr, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        let mtime_ms = millis_since_epoch(attr.mtime);
        Self {
            dev: 0,
            ino: 0,
            mode: attr.mode.bits(),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: attr.size,
            blksize: block_size,
            blocks: attr.size.div_ceil(block_size),
            atime_ms: mtime_ms,
            mtime_ms,
            ctime_ms: mtime_ms,
        }
    }
}

fn millis_since_epoch(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_file_mode() {
        let dir = FileMode::dir(0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.bits(), S_IFDIR | 0o755);

        let file = FileMode::file(0o644);
        assert_eq!(file.kind(), FileType::File);
        assert_eq!(file.perm(), 0o644);

        assert_eq!(FileMode::from_bits(0o600).kind(), FileType::File);
    }

    #[test]
    fn test_chmod_keeps_type_bits() {
        let mode = FileMode::dir(0o755).with_permissions(S_IFREG | S_ISVTX | 0o700);
        assert!(mode.is_dir());
        assert_eq!(mode.bits(), S_IFDIR | S_ISVTX | 0o700);
    }

    #[test]
    fn test_file_attr_constructors() {
        let file = FileAttr::file(1024, 0o644);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);
        assert_eq!(file.perm(), 0o644);

        let dir = FileAttr::directory(0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.perm(), 0o755);
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(read.is_read_only());

        let create = OpenFlags::create_exclusive();
        assert!(create.create);
        assert!(create.exclusive);
        assert!(create.write);
        assert!(!create.is_read_only());
    }

    #[test]
    fn test_open_flags_from_posix() {
        let flags = OpenFlags::from_posix(OpenFlags::O_WRONLY | OpenFlags::O_CREAT | OpenFlags::O_TRUNC);
        assert!(!flags.read);
        assert!(flags.write);
        assert!(flags.create);
        assert!(flags.truncate);
        assert!(!flags.append);

        assert_eq!(OpenFlags::from_posix(OpenFlags::O_RDONLY), OpenFlags::read());
    }

    #[test]
    fn test_stat_from_attr() {
        let mtime = UNIX_EPOCH + Duration::from_millis(1_500);
        let attr = FileAttr::file(4097, 0o644).with_mtime(mtime);
        let stat = Stat::from_attr(&attr, 4096);

        assert_eq!(stat.mode, S_IFREG | 0o644);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.blocks, 2);
        assert_eq!(stat.blksize, 4096);
        assert_eq!(stat.atime_ms, 1_500);
        assert_eq!(stat.ctime_ms, stat.mtime_ms);
        assert_eq!((stat.dev, stat.ino, stat.uid, stat.gid), (0, 0, 0, 0));
    }
}
