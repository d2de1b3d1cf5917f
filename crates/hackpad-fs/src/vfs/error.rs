//! VFS error types.

use std::fmt;
use std::io;
use thiserror::Error;

/// Flat error classification, independent of diagnostic wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    PermissionDenied,
    ReadOnly,
    BadDescriptor,
    CrossDevice,
    NotImplemented,
    Cancelled,
    EndOfStream,
    InvalidPath,
    InvalidInput,
    Storage,
    Io,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::DirectoryNotEmpty => "directory not empty",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ReadOnly => "read-only filesystem",
            ErrorKind::BadDescriptor => "bad file descriptor",
            ErrorKind::CrossDevice => "cross-device link",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::EndOfStream => "end of stream",
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Storage => "storage error",
            ErrorKind::Io => "I/O error",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Unknown descriptor, or a handle used in the wrong direction.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(String),

    /// Operation spans two incompatible mounts.
    #[error("cross-device link")]
    CrossDevice,

    /// Backend does not support this operation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A wait was aborted.
    #[error("operation cancelled")]
    Cancelled,

    /// No more data.
    #[error("end of stream")]
    EndOfStream,

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Record encoding or persisted store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),

    /// An error annotated with the operation and path that produced it.
    #[error("{op} {path}: {source}")]
    Op {
        op: &'static str,
        path: String,
        #[source]
        source: Box<VfsError>,
    },
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a BadDescriptor error.
    pub fn bad_descriptor(what: impl fmt::Display) -> Self {
        Self::BadDescriptor(what.to_string())
    }

    /// Create a NotImplemented error.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an InvalidInput error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a Storage error.
    pub fn storage(msg: impl fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Classify this error, looking through any operation annotations.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::NotFound(_) => ErrorKind::NotFound,
            VfsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            VfsError::NotADirectory(_) => ErrorKind::NotADirectory,
            VfsError::IsADirectory(_) => ErrorKind::IsADirectory,
            VfsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            VfsError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            VfsError::ReadOnly => ErrorKind::ReadOnly,
            VfsError::BadDescriptor(_) => ErrorKind::BadDescriptor,
            VfsError::CrossDevice => ErrorKind::CrossDevice,
            VfsError::NotImplemented(_) => ErrorKind::NotImplemented,
            VfsError::Cancelled => ErrorKind::Cancelled,
            VfsError::EndOfStream => ErrorKind::EndOfStream,
            VfsError::InvalidPath(_) => ErrorKind::InvalidPath,
            VfsError::InvalidInput(_) => ErrorKind::InvalidInput,
            VfsError::Storage(_) => ErrorKind::Storage,
            VfsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::UnexpectedEof => ErrorKind::EndOfStream,
                _ => ErrorKind::Io,
            },
            VfsError::Other(_) => ErrorKind::Other,
            VfsError::Op { source, .. } => source.kind(),
        }
    }

    /// Returns true if this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Strip operation annotations, returning the underlying error.
    pub fn into_inner(self) -> VfsError {
        match self {
            VfsError::Op { source, .. } => source.into_inner(),
            other => other,
        }
    }

    /// Annotate with an operation and path, replacing any existing annotation.
    pub fn with_op(self, op: &'static str, path: impl Into<String>) -> Self {
        VfsError::Op {
            op,
            path: path.into(),
            source: Box::new(self.into_inner()),
        }
    }
}

impl Clone for VfsError {
    fn clone(&self) -> Self {
        match self {
            VfsError::NotFound(s) => VfsError::NotFound(s.clone()),
            VfsError::AlreadyExists(s) => VfsError::AlreadyExists(s.clone()),
            VfsError::NotADirectory(s) => VfsError::NotADirectory(s.clone()),
            VfsError::IsADirectory(s) => VfsError::IsADirectory(s.clone()),
            VfsError::DirectoryNotEmpty(s) => VfsError::DirectoryNotEmpty(s.clone()),
            VfsError::PermissionDenied(s) => VfsError::PermissionDenied(s.clone()),
            VfsError::ReadOnly => VfsError::ReadOnly,
            VfsError::BadDescriptor(s) => VfsError::BadDescriptor(s.clone()),
            VfsError::CrossDevice => VfsError::CrossDevice,
            VfsError::NotImplemented(s) => VfsError::NotImplemented(s.clone()),
            VfsError::Cancelled => VfsError::Cancelled,
            VfsError::EndOfStream => VfsError::EndOfStream,
            VfsError::InvalidPath(s) => VfsError::InvalidPath(s.clone()),
            VfsError::InvalidInput(s) => VfsError::InvalidInput(s.clone()),
            VfsError::Storage(s) => VfsError::Storage(s.clone()),
            // io::Error is not Clone; keep the kind and message.
            VfsError::Io(e) => VfsError::Io(io::Error::new(e.kind(), e.to_string())),
            VfsError::Other(s) => VfsError::Other(s.clone()),
            VfsError::Op { op, path, source } => VfsError::Op {
                op,
                path: path.clone(),
                source: source.clone(),
            },
        }
    }
}

impl From<rusqlite::Error> for VfsError {
    fn from(e: rusqlite::Error) -> Self {
        VfsError::storage(e)
    }
}

impl From<postcard::Error> for VfsError {
    fn from(e: postcard::Error) -> Self {
        VfsError::storage(e)
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        let kind = match e.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::NotADirectory => io::ErrorKind::NotADirectory,
            ErrorKind::IsADirectory => io::ErrorKind::IsADirectory,
            ErrorKind::DirectoryNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::ReadOnly => io::ErrorKind::ReadOnlyFilesystem,
            ErrorKind::CrossDevice => io::ErrorKind::CrossesDevices,
            ErrorKind::NotImplemented => io::ErrorKind::Unsupported,
            ErrorKind::Cancelled => io::ErrorKind::Interrupted,
            ErrorKind::EndOfStream => io::ErrorKind::UnexpectedEof,
            ErrorKind::InvalidPath | ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
            ErrorKind::BadDescriptor | ErrorKind::Storage | ErrorKind::Other => {
                io::ErrorKind::Other
            }
            ErrorKind::Io => match e.into_inner() {
                VfsError::Io(inner) => return inner,
                other => return io::Error::other(other),
            },
        };
        io::Error::new(kind, e)
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

/// Attach operation context to a fallible result.
pub trait ResultExt<T> {
    /// Annotate the error (if any) with the operation name and path.
    fn op(self, op: &'static str, path: &str) -> VfsResult<T>;
}

impl<T> ResultExt<T> for VfsResult<T> {
    fn op(self, op: &'static str, path: &str) -> VfsResult<T> {
        self.map_err(|e| e.with_op(op, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_annotations() {
        let err = VfsError::not_found("/a").with_op("stat", "/a");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "stat /a: not found: /a");
    }

    #[test]
    fn test_rewrap_replaces_annotation() {
        let err = VfsError::directory_not_empty("/d")
            .with_op("remove", "/d")
            .with_op("rmdir", "/mnt/d");
        match &err {
            VfsError::Op { op, path, source } => {
                assert_eq!(*op, "rmdir");
                assert_eq!(path, "/mnt/d");
                assert!(matches!(**source, VfsError::DirectoryNotEmpty(_)));
            }
            other => panic!("expected Op, got {other:?}"),
        }
    }

    #[test]
    fn test_result_ext() {
        let result: VfsResult<()> = Err(VfsError::ReadOnly);
        let err = result.op("mkdir", "/ro").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = VfsError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_into_io_error() {
        let err: io::Error = VfsError::directory_not_empty("/x").with_op("remove", "/x").into();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);

        let err: io::Error = VfsError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
