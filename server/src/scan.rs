//! Folder scanner. Walks a registered root and materializes the canonical
//! on-disk file list as metadata records; the scanner never reads file
//! contents. Ignore rules: built-in denylist, `.gitignore`-style files
//! along the path, then per-folder overrides from the registry.

use crate::error::{Error, Result};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

/// One on-disk file as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFile {
    /// Forward-slash relative path under the folder root.
    pub relative_path: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified_at: u64,
}

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[
    ".git", ".hg", ".svn", "node_modules", "target", "build", "dist", "out", "__pycache__",
    "vendor", ".next", ".venv", "venv", ".idea", ".vscode",
];

/// Extensions that are binary by construction; skipped without sniffing.
/// Anything else suspicious is caught by the pipeline's NUL-byte sniff.
const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "o", "obj", "class", "jar", "wasm", "png", "jpg",
    "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "tar", "gz", "bz2", "xz", "7z", "mp3",
    "mp4", "avi", "mov", "woff", "woff2", "ttf", "eot", "otf", "db", "sqlite", "sqlite3",
];

/// Generated lockfiles are indexed only while small.
const LOCKFILES: &[&str] = &[
    "package-lock.json", "yarn.lock", "pnpm-lock.yaml", "Cargo.lock", "composer.lock",
    "Gemfile.lock", "poetry.lock", "uv.lock",
];

const LOCKFILE_MAX_BYTES: u64 = 256 * 1024;

/// Whether a directory name is on the built-in denylist. Shared with the
/// watcher so filesystem events under these directories never become jobs.
pub fn is_skipped_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

/// Enumerate regular files under `root`. Symlinks are not followed; a
/// symlink is emitted only when it resolves to a regular file inside the
/// same subtree. Output is sorted by relative path for determinism.
pub fn scan_folder(root: &Path, extra_ignores: &[String]) -> Result<Vec<DiskFile>> {
    if !root.is_dir() {
        return Err(Error::NotFound(format!("folder root '{}' is not a directory", root.display())));
    }

    let skip: HashSet<String> = SKIP_DIRS
        .iter()
        .map(|s| s.to_string())
        .chain(extra_ignores.iter().cloned())
        .collect();

    let results: Mutex<Vec<DiskFile>> = Mutex::new(Vec::new());
    let skip_ref = &skip;
    let results_ref = &results;
    let skip_filter = skip.clone();

    WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !skip_filter.contains(name.as_ref());
            }
            true
        })
        .build_parallel()
        .run(|| {
            Box::new(move |entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => return ignore::WalkState::Continue,
                };
                let Some(file_type) = entry.file_type() else {
                    return ignore::WalkState::Continue;
                };
                if file_type.is_dir() {
                    return ignore::WalkState::Continue;
                }

                let abs_path = entry.path();
                if file_type.is_symlink() && !symlink_targets_subtree(abs_path, root) {
                    return ignore::WalkState::Continue;
                }

                let Ok(metadata) = std::fs::metadata(abs_path) else {
                    return ignore::WalkState::Continue;
                };
                if !metadata.is_file() {
                    return ignore::WalkState::Continue;
                }

                let file_name = entry.file_name().to_string_lossy();
                if skip_ref.contains(file_name.as_ref()) {
                    return ignore::WalkState::Continue;
                }
                if has_binary_extension(abs_path) {
                    return ignore::WalkState::Continue;
                }
                if LOCKFILES.contains(&file_name.as_ref()) && metadata.len() > LOCKFILE_MAX_BYTES {
                    return ignore::WalkState::Continue;
                }

                let relative_path = abs_path
                    .strip_prefix(root)
                    .unwrap_or(abs_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let modified_at = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);

                results_ref.lock().unwrap().push(DiskFile {
                    relative_path,
                    size: metadata.len(),
                    modified_at,
                });
                ignore::WalkState::Continue
            })
        });

    let mut files = results.into_inner().unwrap();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.as_str()))
}

/// A symlink qualifies only when its resolved target is a regular file
/// within the folder subtree.
fn symlink_targets_subtree(link: &Path, root: &Path) -> bool {
    let Ok(target) = std::fs::canonicalize(link) else { return false };
    let Ok(canonical_root) = std::fs::canonicalize(root) else { return false };
    target.is_file() && target.starts_with(&canonical_root)
}
