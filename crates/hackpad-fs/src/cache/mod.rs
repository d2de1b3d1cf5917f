//! Cache layers that wrap slower filesystems.
//!
//! - [`ReadThroughCache`] - promotes a read-only base's files into a fast store on first open
//! - [`StatCache`] - memoizes `stat` and `readdir`, invalidated on mutation
//! - [`ArtifactCache`] - memoizes derived artifacts (compiled forms) per path
//!
//! Each layer implements [`VfsOps`](crate::vfs::VfsOps) so it can be mounted
//! directly or stacked.

mod artifact;
mod read_through;
mod stat;

pub use artifact::ArtifactCache;
pub use read_through::ReadThroughCache;
pub use stat::StatCache;

use std::fmt;
use std::sync::Arc;

use crate::vfs::path;

/// Decides which canonical paths a cache may hold.
#[derive(Clone, Default)]
pub enum PathPredicate {
    /// Every path is cacheable.
    #[default]
    All,
    /// Paths at or beneath any of these prefixes.
    Prefixes(Vec<String>),
    /// Caller-supplied test.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for PathPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPredicate::All => f.write_str("All"),
            PathPredicate::Prefixes(p) => f.debug_tuple("Prefixes").field(p).finish(),
            PathPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PathPredicate {
    /// Build from configured prefixes; an empty list admits every path.
    ///
    /// A trailing `/` on a prefix is ignored, so `/usr/local/go/` matches
    /// the directory itself as well as its contents.
    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes: Vec<String> = prefixes
            .into_iter()
            .map(|p| path::normalize(p.as_ref()))
            .collect();
        if prefixes.is_empty() {
            PathPredicate::All
        } else {
            PathPredicate::Prefixes(prefixes)
        }
    }

    /// Build from namespace-wide prefixes for a layer mounted at `mount`,
    /// which sees paths re-rooted at its own `/`.
    ///
    /// A prefix covering the whole mount admits everything; prefixes inside
    /// it are re-rooted; prefixes elsewhere are dropped.
    pub fn for_mount<S: AsRef<str>>(prefixes: &[S], mount: &str) -> Self {
        if prefixes.is_empty() {
            return PathPredicate::All;
        }
        let mount = path::normalize(mount);
        let mut scoped = Vec::new();
        for prefix in prefixes {
            let prefix = path::normalize(prefix.as_ref());
            if path::is_within(&mount, &prefix) {
                return PathPredicate::All;
            }
            if let Some(relative) = path::strip_prefix(&prefix, &mount) {
                scoped.push(relative);
            }
        }
        PathPredicate::Prefixes(scoped)
    }

    /// Test a canonical path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPredicate::All => true,
            PathPredicate::Prefixes(prefixes) => prefixes.iter().any(|p| path::is_within(path, p)),
            PathPredicate::Custom(f) => f(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_predicate() {
        let pred = PathPredicate::from_prefixes(["/usr/local/go/"]);
        assert!(pred.matches("/usr/local/go"));
        assert!(pred.matches("/usr/local/go/bin/go"));
        assert!(!pred.matches("/usr/local/gopher"));
        assert!(!pred.matches("/home"));
    }

    #[test]
    fn test_empty_prefixes_admit_everything() {
        let pred = PathPredicate::from_prefixes(Vec::<String>::new());
        assert!(pred.matches("/anything"));
    }

    #[test]
    fn test_for_mount() {
        let pred = PathPredicate::for_mount(&["/usr/local/go/"], "/usr/local/go");
        assert!(pred.matches("/bin/go"));

        let pred = PathPredicate::for_mount(&["/home/me/cache"], "/home");
        assert!(pred.matches("/me/cache/x"));
        assert!(!pred.matches("/me/notes"));

        let pred = PathPredicate::for_mount(&["/tmp"], "/home");
        assert!(!pred.matches("/anything"));
    }

    #[test]
    fn test_custom_predicate() {
        let pred = PathPredicate::Custom(Arc::new(|p: &str| p.ends_with(".go")));
        assert!(pred.matches("/main.go"));
        assert!(!pred.matches("/main.rs"));
    }
}
