//! Path Guard: the only component allowed to reject a path on the path
//! string alone. Invoked when a folder is added through the dispatcher and
//! again inside the file watcher before registering a watch, so a folder
//! that somehow persisted with a forbidden path is refused at watch time.

use crate::config::Config;
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Validates indexing roots against the configured allow/deny prefixes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    allowed_prefixes: Vec<PathBuf>,
    deny_prefixes: Vec<PathBuf>,
    min_depth: usize,
}

impl PathGuard {
    pub fn new(config: &Config) -> Self {
        Self {
            allowed_prefixes: config.allowed_prefixes.iter().map(PathBuf::from).collect(),
            deny_prefixes: config.deny_prefixes.iter().map(PathBuf::from).collect(),
            min_depth: config.min_path_depth,
        }
    }

    /// Validate a candidate indexing root. Returns the canonicalized path on
    /// success; every rejection carries an actionable reason.
    pub fn validate(&self, path: &Path) -> Result<PathBuf> {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            Error::PathRejected(format!("cannot canonicalize '{}': {e}", path.display()))
        })?;

        if !canonical.is_absolute() {
            return Err(Error::PathRejected(format!(
                "'{}' is not absolute after canonicalization",
                canonical.display()
            )));
        }

        if is_filesystem_root(&canonical) {
            return Err(Error::PathRejected(
                "refusing to index the root filesystem".to_string(),
            ));
        }

        let depth = path_depth(&canonical);
        if depth < self.min_depth {
            return Err(Error::PathRejected(format!(
                "'{}' is too shallow (depth {depth}, minimum {})",
                canonical.display(),
                self.min_depth
            )));
        }

        for deny in &self.deny_prefixes {
            if canonical.starts_with(deny) {
                return Err(Error::PathRejected(format!(
                    "'{}' is under the system denylist prefix '{}'",
                    canonical.display(),
                    deny.display()
                )));
            }
        }

        if !self.allowed_prefixes.iter().any(|allow| canonical.starts_with(allow)) {
            return Err(Error::PathRejected(format!(
                "'{}' does not match any allowed prefix ({})",
                canonical.display(),
                self.allowed_prefixes
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        Ok(canonical)
    }
}

/// True for `/` and for Windows drive roots like `C:\`.
fn is_filesystem_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Number of normal components after the root.
fn path_depth(path: &Path) -> usize {
    path.components().filter(|c| matches!(c, Component::Normal(_))).count()
}
