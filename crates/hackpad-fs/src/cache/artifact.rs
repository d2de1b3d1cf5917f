//! Compiled-artifact cache.
//!
//! Holds a derived artifact per path (a parsed or compiled form of the
//! file's bytes). Any operation that may change those bytes drops the
//! entry; reads never do.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::PathPredicate;
use crate::vfs::path;
use crate::vfs::{FileAttr, FileHandle, OpenFlags, VfsOps, VfsResult};

/// Filesystem wrapper that memoizes one artifact of type `A` per path.
pub struct ArtifactCache<A> {
    inner: Arc<dyn VfsOps>,
    predicate: PathPredicate,
    artifacts: DashMap<String, A>,
    /// Per-path compile locks; one compilation per path at a time.
    compiling: DashMap<String, Arc<Mutex<()>>>,
    /// Bumped on every invalidation so a compile that raced one is not stored.
    generation: AtomicU64,
    name: String,
}

impl<A> std::fmt::Debug for ArtifactCache<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("name", &self.name)
            .field("entries", &self.artifacts.len())
            .finish()
    }
}

impl<A> ArtifactCache<A>
where
    A: Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn VfsOps>, predicate: PathPredicate) -> Self {
        let name = format!("artifact-cache({})", inner.name());
        Self {
            inner,
            predicate,
            artifacts: DashMap::new(),
            compiling: DashMap::new(),
            generation: AtomicU64::new(0),
            name,
        }
    }

    pub fn get(&self, path: &str) -> Option<A> {
        self.artifacts.get(&path::normalize(path)).map(|a| a.value().clone())
    }

    /// Store an artifact produced elsewhere. Ignored for paths outside the
    /// predicate.
    pub fn insert(&self, path: &str, artifact: A) {
        let path = path::normalize(path);
        if self.predicate.matches(&path) {
            self.artifacts.insert(path, artifact);
        }
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Return the cached artifact for `path`, or read the file and run
    /// `compile` over its bytes.
    ///
    /// Concurrent first calls for one path compile once. Compile errors are
    /// returned and nothing is stored.
    pub async fn get_or_compile<F, Fut>(&self, path: &str, compile: F) -> VfsResult<A>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = VfsResult<A>> + Send,
    {
        let path = path::normalize(path);
        if let Some(hit) = self.artifacts.get(&path) {
            return Ok(hit.value().clone());
        }
        if !self.predicate.matches(&path) {
            let bytes = self.inner.read_all(&path).await?;
            return compile(bytes).await;
        }

        let lock = Arc::clone(self.compiling.entry(path.clone()).or_default().value());
        let result = {
            let _guard = lock.lock().await;
            self.compile_locked(&path, compile).await
        };
        self.compiling.remove_if(&path, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) <= 2);
        result
    }

    async fn compile_locked<F, Fut>(&self, path: &str, compile: F) -> VfsResult<A>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = VfsResult<A>> + Send,
    {
        if let Some(hit) = self.artifacts.get(path) {
            return Ok(hit.value().clone());
        }
        let generation = self.generation.load(Ordering::Acquire);
        let bytes = self.inner.read_all(path).await?;
        let artifact = compile(bytes).await?;
        if self.generation.load(Ordering::Acquire) == generation {
            self.artifacts.insert(path.to_string(), artifact.clone());
            tracing::debug!(path = %path, "artifact cached");
        }
        Ok(artifact)
    }

    /// Drop the artifact for `path` and anything beneath it.
    pub fn invalidate(&self, path: &str) {
        let path = path::normalize(path);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.artifacts.retain(|p, _| !path::is_within(p, &path));
    }
}

#[async_trait]
impl<A> VfsOps for ArtifactCache<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        self.inner.stat(path).await
    }

    async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn FileHandle>> {
        if !flags.is_read_only() {
            self.invalidate(path);
        }
        self.inner.open(path, flags, mode).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<String>> {
        self.inner.readdir(path).await
    }

    async fn create(&self, path: &str) -> VfsResult<Box<dyn FileHandle>> {
        self.invalidate(path);
        self.inner.create(path).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.inner.mkdir(path, mode).await
    }

    async fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.inner.mkdir_all(path, mode).await
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        self.invalidate(path);
        self.inner.remove(path).await
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        self.invalidate(path);
        self.inner.remove_all(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.invalidate(from);
        self.invalidate(to);
        self.inner.rename(from, to).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.inner.chmod(path, mode).await
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.inner.chtimes(path, atime, mtime).await
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{StorerFs, VfsError};
    use std::sync::atomic::AtomicUsize;

    async fn layer() -> ArtifactCache<Arc<String>> {
        let inner = Arc::new(StorerFs::in_memory().await.unwrap());
        ArtifactCache::new(inner, PathPredicate::All)
    }

    async fn upper(bytes: Vec<u8>) -> VfsResult<Arc<String>> {
        Ok(Arc::new(String::from_utf8_lossy(&bytes).to_uppercase()))
    }

    #[tokio::test]
    async fn test_compiles_once_and_reuses() {
        let cache = layer().await;
        cache.write_all("/main.go", b"package main").await.unwrap();

        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            let out = cache
                .get_or_compile("/main.go", |b| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    upper(b)
                })
                .await
                .unwrap();
            assert_eq!(out.as_str(), "PACKAGE MAIN");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reads_keep_artifact() {
        let cache = layer().await;
        cache.write_all("/f", b"a").await.unwrap();
        cache.get_or_compile("/f", upper).await.unwrap();

        cache.read_all("/f").await.unwrap();
        cache.stat("/f").await.unwrap();
        assert!(cache.get("/f").is_some());
    }

    #[tokio::test]
    async fn test_write_open_drops_artifact() {
        let cache = layer().await;
        cache.write_all("/f", b"a").await.unwrap();
        cache.get_or_compile("/f", upper).await.unwrap();

        cache.write_all("/f", b"b").await.unwrap();
        assert!(cache.get("/f").is_none());
        assert_eq!(cache.get_or_compile("/f", upper).await.unwrap().as_str(), "B");
    }

    #[tokio::test]
    async fn test_remove_and_rename_drop_artifacts() {
        let cache = layer().await;
        cache.write_all("/a", b"a").await.unwrap();
        cache.write_all("/b", b"b").await.unwrap();
        cache.get_or_compile("/a", upper).await.unwrap();
        cache.get_or_compile("/b", upper).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.rename("/a", "/b").await.unwrap();
        assert!(cache.is_empty());

        cache.get_or_compile("/b", upper).await.unwrap();
        cache.remove("/b").await.unwrap();
        assert!(cache.get("/b").is_none());
    }

    #[tokio::test]
    async fn test_compile_error_not_cached() {
        let cache = layer().await;
        cache.write_all("/f", b"a").await.unwrap();
        let err = cache
            .get_or_compile("/f", |_| async { Err::<Arc<String>, _>(VfsError::invalid_input("bad")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::vfs::ErrorKind::InvalidInput);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_predicate_skips_storage() {
        let inner = Arc::new(StorerFs::in_memory().await.unwrap());
        let cache: ArtifactCache<Arc<String>> =
            ArtifactCache::new(inner, PathPredicate::from_prefixes(["/usr/local/go/"]));
        cache.write_all("/tmp.go", b"x").await.unwrap();
        assert_eq!(cache.get_or_compile("/tmp.go", upper).await.unwrap().as_str(), "X");
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_compiles_run_once() {
        let cache = Arc::new(layer().await);
        cache.write_all("/lib.go", b"package lib").await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compile("/lib.go", move |b| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        upper(b).await
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().as_str(), "PACKAGE LIB");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
