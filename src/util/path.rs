use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Canonical path of the sync root itself.
pub const ROOT_PATH: &str = "";

/// Translates between absolute local paths and canonical remote-relative
/// paths. Canonical paths use forward slashes, carry no leading or
/// trailing separator, and the sync root maps to [`ROOT_PATH`].
#[derive(Debug, Clone)]
pub struct PathMapper {
    local_root: PathBuf,
}

impl PathMapper {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn to_canonical(&self, local: &Path) -> Result<String> {
        relative_path(&self.local_root, local)
    }

    pub fn to_local(&self, canonical: &str) -> PathBuf {
        if canonical.is_empty() {
            return self.local_root.clone();
        }
        canonical
            .split('/')
            .fold(self.local_root.clone(), |acc, segment| acc.join(segment))
    }
}

/// Compute the relative path from `base` to `full`.
/// Both paths should be absolute. Returns a forward-slash separated string
/// suitable for use as a platform-independent sync key.
pub fn relative_path(base: &Path, full: &Path) -> Result<String> {
    let rel = full
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", full.display(), base.display()))?;

    let s = rel.to_string_lossy().replace('\\', "/");
    Ok(s.trim_matches('/').to_string())
}

/// Append one name to a canonical path.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a canonical path into `(parent, name)`. The root has no parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').unwrap_or((ROOT_PATH, path)))
}
