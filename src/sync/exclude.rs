use std::path::{Path, PathBuf};

use glob::Pattern;

/// Paths that are never watched or synced.
///
/// A path is excluded if its base name matches one of the glob patterns
/// (`*`, `?` and `[...]` classes), or if it is one of the excluded paths
/// (by file identity) or lies below one.
#[derive(Debug, Clone, Default)]
pub struct Exclude {
    patterns: Vec<Pattern>,
    paths: Vec<PathBuf>,
}

/// Reject a pattern that does not parse as a glob.
pub fn validate_pattern(pattern: &str) -> anyhow::Result<()> {
    Pattern::new(pattern)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("invalid exclude pattern {pattern:?}: {e}"))
}

impl Exclude {
    pub fn new(patterns: &[String], paths: &[PathBuf]) -> Self {
        let mut exclude = Self::default();
        exclude.add_patterns(patterns.iter().cloned());
        exclude.add_paths(paths.iter().cloned());
        exclude
    }

    /// Patterns that fail to parse are logged and skipped.
    pub fn add_patterns(&mut self, patterns: impl IntoIterator<Item = String>) {
        for p in patterns {
            match Pattern::new(&p) {
                Ok(pattern) if !self.patterns.contains(&pattern) => self.patterns.push(pattern),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern")
                }
            }
        }
    }

    pub fn add_paths(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for p in paths {
            let p = normalize(&p);
            if !self.paths.contains(&p) {
                self.paths.push(p);
            }
        }
    }

    pub fn is_match(&self, path: &Path) -> bool {
        self.matches_pattern(path) || self.matches_path(path)
    }

    fn matches_pattern(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        self.patterns.iter().any(|p| p.matches(&name))
    }

    fn matches_path(&self, path: &Path) -> bool {
        if self.paths.is_empty() {
            return false;
        }
        let path = normalize(path);
        self.paths
            .iter()
            .any(|excluded| path.starts_with(excluded) || same_file(&path, excluded))
    }
}

/// Lexically clean a path: drop `.` components and resolve `..` where possible.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}
