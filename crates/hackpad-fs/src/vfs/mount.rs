//! VFS mount table with longest-prefix routing.
//!
//! Routes filesystem operations to the appropriate backend based on path.
//! Each backend sees paths re-rooted at its own `/`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;

use super::error::{ErrorKind, ResultExt, VfsError, VfsResult};
use super::ops::{FileHandle, VfsOps, COPY_CHUNK};
use super::path::{self, ROOT};
use super::types::{FileAttr, OpenFlags};

/// Information about a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// The mount path (e.g., "/usr/local/go").
    pub path: String,
    /// Backend name.
    pub backend: String,
    /// Whether this mount is read-only.
    pub read_only: bool,
}

struct Binding {
    prefix: String,
    fs: Arc<dyn VfsOps>,
}

/// A routed path: the selected backend and the path it should see.
struct Route {
    fs: Arc<dyn VfsOps>,
    prefix: String,
    relative: String,
}

/// Routes filesystem operations to mounted backends.
///
/// Mount points are matched by longest prefix. For example, if `/mnt` and
/// `/mnt/project` are both mounted, a path like `/mnt/project/src/main.go`
/// will be routed to the `/mnt/project` mount. Paths under no mount fall
/// back to the root binding, which always exists.
pub struct MountTable {
    /// Bindings in registration order; index 0 is the root.
    bindings: RwLock<Vec<Binding>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &self.list_mounts())
            .finish()
    }
}

impl MountTable {
    /// Create a table with `root` bound at `/`.
    pub fn new(root: Arc<dyn VfsOps>) -> Self {
        Self {
            bindings: RwLock::new(vec![Binding {
                prefix: ROOT.to_string(),
                fs: root,
            }]),
        }
    }

    /// Mount a filesystem at the given path.
    ///
    /// The path must currently resolve to a directory. The root cannot be
    /// mounted over and each prefix can be bound once.
    pub async fn mount(&self, path: &str, fs: Arc<dyn VfsOps>) -> VfsResult<()> {
        let path = path::normalize(path);
        if path == ROOT || self.is_mount_point(&path) {
            return Err(VfsError::already_exists(path.clone())).op("mount", &path);
        }
        let attr = self.stat(&path).await.op("mount", &path)?;
        if !attr.is_dir() {
            return Err(VfsError::not_a_directory(path.clone())).op("mount", &path);
        }

        let mut bindings = self.bindings.write();
        if bindings.iter().any(|b| b.prefix == path) {
            return Err(VfsError::already_exists(path.clone())).op("mount", &path);
        }
        tracing::info!(path = %path, backend = fs.name(), read_only = fs.read_only(), "mounted filesystem");
        bindings.push(Binding { prefix: path, fs });
        Ok(())
    }

    /// List all current mounts, root first.
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.bindings
            .read()
            .iter()
            .map(|b| MountInfo {
                path: b.prefix.clone(),
                backend: b.fs.name().to_string(),
                read_only: b.fs.read_only(),
            })
            .collect()
    }

    /// True if `path` is exactly a registered mount prefix (root included).
    pub fn is_mount_point(&self, path: &str) -> bool {
        let path = path::normalize(path);
        self.bindings.read().iter().any(|b| b.prefix == path)
    }

    /// True if a mount other than the root sits at or beneath `path`.
    fn holds_mount(&self, path: &str) -> bool {
        self.bindings
            .read()
            .iter()
            .skip(1)
            .any(|b| path::is_within(&b.prefix, path))
    }

    /// The backend that serves `path` and the mount prefix it was bound at.
    pub fn lookup(&self, path: &str) -> (Arc<dyn VfsOps>, String) {
        let route = self.route(&path::normalize(path));
        (route.fs, route.prefix)
    }

    fn route(&self, path: &str) -> Route {
        let bindings = self.bindings.read();
        // Root is at index 0 and matches everything.
        let mut best = &bindings[0];
        for binding in bindings.iter().skip(1) {
            if binding.prefix.len() > best.prefix.len() && path::is_within(path, &binding.prefix) {
                best = binding;
            }
        }
        let relative = path::strip_prefix(path, &best.prefix).unwrap_or_else(|| ROOT.to_string());
        tracing::trace!(path = %path, mount = %best.prefix, relative = %relative, "routed");
        Route {
            fs: Arc::clone(&best.fs),
            prefix: best.prefix.clone(),
            relative,
        }
    }

    /// Total size in bytes of every file at or beneath `path`.
    pub async fn disk_usage(&self, path: &str) -> VfsResult<u64> {
        let root = path::normalize(path);
        let mut total = 0u64;
        let mut pending = vec![root];
        while let Some(current) = pending.pop() {
            let attr = self.stat(&current).await?;
            if attr.is_dir() {
                for name in self.readdir(&current).await? {
                    pending.push(path::join(&current, &name));
                }
            } else {
                total += attr.size;
            }
        }
        Ok(total)
    }

    /// Emulate a cross-mount file rename: copy, then remove the source.
    async fn copy_across(&self, from: &Route, to: &Route, attr: &FileAttr) -> VfsResult<()> {
        let mut src = from.fs.open(&from.relative, OpenFlags::read(), 0).await?;
        let dst_flags = OpenFlags {
            read: false,
            ..OpenFlags::create_truncate()
        };
        let mut dst = match to.fs.open(&to.relative, dst_flags, attr.perm()).await {
            Ok(dst) => dst,
            Err(e) => {
                let _ = src.close().await;
                return Err(e);
            }
        };
        let copied = copy_handle(src.as_mut(), dst.as_mut()).await;
        let src_closed = src.close().await;
        let dst_closed = dst.close().await;
        copied?;
        src_closed?;
        dst_closed?;
        from.fs.remove(&from.relative).await
    }
}

/// Copy everything readable from `src` into `dst`.
pub(crate) async fn copy_handle(src: &mut dyn FileHandle, dst: &mut dyn FileHandle) -> VfsResult<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::EndOfStream => break,
            Err(e) => return Err(e),
        };
        let mut written = 0;
        while written < n {
            written += dst.write(&buf[written..n]).await?;
        }
        total += n as u64;
    }
    Ok(total)
}

#[async_trait]
impl VfsOps for MountTable {
    fn name(&self) -> &str {
        "mounts"
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.stat(&route.relative).await.op("stat", &path)
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        let route = self.route(&path);
        tracing::debug!(path = %path, mount = %route.prefix, ?flags, "open");
        route.fs.open(&route.relative, flags, mode).await.op("open", &path)
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.readdir(&route.relative).await.op("readdir", &path)
    }

    async fn create(&self, path: &str) -> VfsResult<Box<dyn FileHandle>> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.create(&route.relative).await.op("create", &path)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.mkdir(&route.relative, mode).await.op("mkdir", &path)
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let path = path::normalize(path);
        if path != ROOT && self.is_mount_point(&path) {
            return Err(VfsError::not_implemented("remove of a mount point")).op("remove", &path);
        }
        let route = self.route(&path);
        route.fs.remove(&route.relative).await.op("remove", &path)
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.remove_all(&route.relative).await.op("remove_all", &path)
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from, to) = (path::normalize(from), path::normalize(to));
        // Bindings are keyed by path; moving one out from under its prefix
        // would leave it bound to a name that no longer exists.
        if self.holds_mount(&from) {
            return Err(VfsError::not_implemented("rename of a path holding a mount point"))
                .op("rename", &from);
        }
        let src = self.route(&from);
        let dst = self.route(&to);

        if src.prefix == dst.prefix {
            return src.fs.rename(&src.relative, &dst.relative).await.op("rename", &from);
        }

        let attr = src.fs.stat(&src.relative).await.op("rename", &from)?;
        if attr.is_dir() {
            return Err(VfsError::CrossDevice).op("rename", &from);
        }
        tracing::debug!(from = %from, to = %to, "cross-mount rename via copy");
        self.copy_across(&src, &dst, &attr).await.op("rename", &from)
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route.fs.chmod(&route.relative, mode).await.op("chmod", &path)
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let path = path::normalize(path);
        let route = self.route(&path);
        route
            .fs
            .chtimes(&route.relative, atime, mtime)
            .await
            .op("chtimes", &path)
    }

    fn read_only(&self) -> bool {
        // Mount table itself isn't read-only; individual mounts might be
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::{tar_gz, ArchiveFs, StorerFs};

    async fn memory() -> Arc<dyn VfsOps> {
        Arc::new(StorerFs::in_memory().await.unwrap())
    }

    async fn table() -> MountTable {
        MountTable::new(memory().await)
    }

    #[tokio::test]
    async fn test_unmounted_paths_use_root() {
        let table = table().await;
        table.write_all("/at-root.txt", b"root file").await.unwrap();

        let (_, prefix) = table.lookup("/at-root.txt");
        assert_eq!(prefix, "/");
        let (_, prefix) = table.lookup("/no/such/path");
        assert_eq!(prefix, "/");
        assert_eq!(table.read_all("/at-root.txt").await.unwrap(), b"root file");
    }

    #[tokio::test]
    async fn test_basic_mount() {
        let table = table().await;
        table.mkdir("/scratch", 0o755).await.unwrap();

        let scratch = memory().await;
        scratch.write_all("/test.txt", b"hello").await.unwrap();
        table.mount("/scratch", Arc::clone(&scratch)).await.unwrap();

        assert_eq!(table.read_all("/scratch/test.txt").await.unwrap(), b"hello");
        assert_eq!(table.readdir("/scratch").await.unwrap(), vec!["test.txt"]);

        // Writes land in the mounted backend under its own root.
        table.write_all("/scratch/new.txt", b"created").await.unwrap();
        assert_eq!(scratch.read_all("/new.txt").await.unwrap(), b"created");
    }

    #[tokio::test]
    async fn test_nested_mount() {
        let table = table().await;
        table.mkdir_all("/mnt/project", 0o755).await.unwrap();

        let outer = memory().await;
        outer.mkdir("/project", 0o755).await.unwrap();
        outer.write_all("/outer.txt", b"outer").await.unwrap();
        table.mount("/mnt", outer).await.unwrap();

        let inner = memory().await;
        inner.write_all("/inner.txt", b"inner").await.unwrap();
        table.mount("/mnt/project", inner).await.unwrap();

        assert_eq!(table.read_all("/mnt/outer.txt").await.unwrap(), b"outer");
        assert_eq!(table.read_all("/mnt/project/inner.txt").await.unwrap(), b"inner");
        assert_eq!(table.lookup("/mnt/projectx").1, "/mnt");
    }

    #[tokio::test]
    async fn test_mount_rejects_root_and_duplicates() {
        let table = table().await;
        let err = table.mount("/", memory().await).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        table.mkdir("/data", 0o755).await.unwrap();
        table.mount("/data", memory().await).await.unwrap();
        let err = table.mount("/data/", memory().await).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_mount_requires_directory() {
        let table = table().await;
        let err = table.mount("/missing", memory().await).await.unwrap_err();
        assert!(err.is_not_found());

        table.write_all("/file", b"").await.unwrap();
        let err = table.mount("/file", memory().await).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn test_list_mounts() {
        let table = table().await;
        table.mkdir("/scratch", 0o755).await.unwrap();
        table.mkdir("/data", 0o755).await.unwrap();
        table.mount("/scratch", memory().await).await.unwrap();
        table.mount("/data", memory().await).await.unwrap();

        let mounts = table.list_mounts();
        let paths: Vec<_> = mounts.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/scratch", "/data"]);
        assert!(mounts.iter().all(|m| !m.read_only));
    }

    #[tokio::test]
    async fn test_remove_mount_point_not_implemented() {
        let table = table().await;
        table.mkdir("/m", 0o755).await.unwrap();
        table.mount("/m", memory().await).await.unwrap();
        let err = table.remove("/m").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn test_rename_over_nested_mount_rejected() {
        let table = table().await;
        table.mkdir_all("/work/mnt", 0o755).await.unwrap();
        table.mount("/work/mnt", memory().await).await.unwrap();

        let err = table.rename("/work", "/moved").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        let err = table.rename("/work/mnt", "/work/other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        assert!(table.stat("/work/mnt").await.unwrap().is_dir());

        // Siblings that merely share a name prefix are unaffected.
        table.mkdir("/workshop", 0o755).await.unwrap();
        table.rename("/workshop", "/studio").await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_mount_file_rename_copies() {
        let table = table().await;
        table.mkdir("/a", 0o755).await.unwrap();
        table.mkdir("/b", 0o755).await.unwrap();
        let a = memory().await;
        let b = memory().await;
        table.mount("/a", Arc::clone(&a)).await.unwrap();
        table.mount("/b", Arc::clone(&b)).await.unwrap();

        table.write_all("/a/file.txt", b"moving").await.unwrap();
        table.chmod("/a/file.txt", 0o600).await.unwrap();
        table.rename("/a/file.txt", "/b/moved.txt").await.unwrap();

        assert!(a.stat("/file.txt").await.unwrap_err().is_not_found());
        assert_eq!(b.read_all("/moved.txt").await.unwrap(), b"moving");
        assert_eq!(b.stat("/moved.txt").await.unwrap().perm(), 0o600);
    }

    #[tokio::test]
    async fn test_cross_mount_dir_rename_fails() {
        let table = table().await;
        table.mkdir("/a", 0o755).await.unwrap();
        table.mkdir("/b", 0o755).await.unwrap();
        table.mount("/a", memory().await).await.unwrap();
        table.mount("/b", memory().await).await.unwrap();
        table.mkdir("/a/dir", 0o755).await.unwrap();

        let err = table.rename("/a/dir", "/b/dir").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossDevice);
    }

    #[tokio::test]
    async fn test_errors_carry_full_path() {
        let table = table().await;
        table.mkdir("/m", 0o755).await.unwrap();
        table.mount("/m", memory().await).await.unwrap();
        let err = table.stat("/m/nothing").await.unwrap_err();
        assert_eq!(err.to_string(), "stat /m/nothing: not found: /nothing");
    }

    #[tokio::test]
    async fn test_read_only_mount() {
        let table = table().await;
        table.mkdir("/ro", 0o755).await.unwrap();
        let archive = ArchiveFs::from_bytes(tar_gz(&[], &[("f", "data")]));
        table.mount("/ro", Arc::new(archive)).await.unwrap();

        assert_eq!(table.read_all("/ro/f").await.unwrap(), b"data");
        let err = table.mkdir("/ro/d", 0o755).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
        assert!(table.list_mounts()[1].read_only);
    }

    #[tokio::test]
    async fn test_disk_usage() {
        let table = table().await;
        table.mkdir_all("/u/v", 0o755).await.unwrap();
        table.write_all("/u/a", b"123").await.unwrap();
        table.write_all("/u/v/b", b"4567").await.unwrap();
        table.write_all("/outside", b"zz").await.unwrap();

        assert_eq!(table.disk_usage("/u").await.unwrap(), 7);
        assert_eq!(table.disk_usage("/").await.unwrap(), 9);
    }
}
