//! Filesystem configuration, loaded from RON.
//!
//! ```ron
//! (
//!     min_fd: 3,
//!     pipe_capacity: 4096,
//!     stat_cache_prefixes: ["/home/"],
//! )
//! ```
//!
//! Every field is optional; omitted fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::PathPredicate;

/// Tunables shared by the descriptor table, pipes and cache layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Descriptor IDs below this are the implicit standard streams.
    pub min_fd: u64,
    /// Pipe buffer size in bytes.
    pub pipe_capacity: usize,
    /// Nominal block size used for `stat` block counts.
    pub block_size: u64,
    /// Advisory lock retry interval.
    pub lock_poll_interval_ms: u64,
    /// Pending bytes on stdout/stderr are flushed once they exceed this.
    pub line_buffer_limit: usize,
    /// Paths eligible for the metadata cache. Empty means everything.
    pub stat_cache_prefixes: Vec<String>,
    /// Paths eligible for the compiled-artifact cache.
    pub artifact_cache_prefixes: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            min_fd: 3,
            pipe_capacity: 4096,
            block_size: 4096,
            lock_poll_interval_ms: 10,
            line_buffer_limit: 4096,
            stat_cache_prefixes: Vec::new(),
            artifact_cache_prefixes: vec!["/usr/local/go/".to_string()],
        }
    }
}

impl FsConfig {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn with_min_fd(mut self, min_fd: u64) -> Self {
        self.min_fd = min_fd;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_line_buffer_limit(mut self, limit: usize) -> Self {
        self.line_buffer_limit = limit;
        self
    }

    pub fn with_stat_cache_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stat_cache_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifact_cache_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifact_cache_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Metadata-cache predicate for a layer mounted at `mount`.
    pub fn stat_cache_predicate(&self, mount: &str) -> PathPredicate {
        PathPredicate::for_mount(&self.stat_cache_prefixes[..], mount)
    }

    /// Artifact-cache predicate for a layer mounted at `mount`.
    pub fn artifact_cache_predicate(&self, mount: &str) -> PathPredicate {
        PathPredicate::for_mount(&self.artifact_cache_prefixes[..], mount)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FsConfig::default();
        assert_eq!(config.min_fd, 3);
        assert_eq!(config.pipe_capacity, 4096);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(10));
        assert_eq!(config.artifact_cache_prefixes, vec!["/usr/local/go/"]);
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = FsConfig::from_ron("(pipe_capacity: 16, stat_cache_prefixes: [\"/home/\"])").unwrap();
        assert_eq!(config.pipe_capacity, 16);
        assert_eq!(config.stat_cache_prefixes, vec!["/home/"]);
        assert_eq!(config.min_fd, 3);
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn test_cache_predicates() {
        let config = FsConfig::default();
        assert!(config.stat_cache_predicate("/home").matches("/anything"));

        let go = config.artifact_cache_predicate("/usr/local/go");
        assert!(go.matches("/src/fmt/print.go"));
        let root = config.artifact_cache_predicate("/");
        assert!(root.matches("/usr/local/go/bin/go"));
        assert!(!root.matches("/home/main.go"));
    }

    #[test]
    fn test_bad_ron() {
        assert!(matches!(FsConfig::from_ron("(pipe_capacity: \"big\")"), Err(ConfigError::Ron(_))));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(min_fd: 10, lock_poll_interval_ms: 1)").unwrap();
        let config = FsConfig::load(file.path()).unwrap();
        assert_eq!(config.min_fd, 10);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(1));

        let missing = FsConfig::load("/definitely/not/here.ron");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
