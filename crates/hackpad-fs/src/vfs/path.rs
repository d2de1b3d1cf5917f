//! Canonical path helpers.
//!
//! Every storage key and mount lookup uses the canonical form: absolute,
//! `/`-separated, no `.` or `..` components, no trailing slash (except root).

/// The namespace root.
pub const ROOT: &str = "/";

/// Canonicalize a path. Relative paths are taken from the root; `..` at the
/// root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Parent of a canonical path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Final component of a canonical path. Empty for the root.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a canonical directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True if `path` is `prefix` or lies beneath it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix == ROOT
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Re-root `path` below `prefix`: `/mnt/a/b` under `/mnt/a` becomes `/b`.
///
/// Returns `None` when `path` is not within `prefix`.
pub fn strip_prefix(path: &str, prefix: &str) -> Option<String> {
    if !is_within(path, prefix) {
        return None;
    }
    if prefix == ROOT {
        return Some(path.to_string());
    }
    let rest = &path[prefix.len()..];
    if rest.is_empty() {
        Some(ROOT.to_string())
    } else {
        Some(rest.to_string())
    }
}
