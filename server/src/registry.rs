//! Folder registry. Owns the lifecycle of registered folders: guard-checked
//! creation, nesting conflict enforcement, pause/resume, and the cascade on
//! removal. Children (files, chunks, vectors) reference folders by id only.

use crate::error::{Error, Result};
use crate::guard::PathGuard;
use crate::meta::{now_millis, FolderRecord, FolderState, MetaStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct FolderRegistry {
    meta: Arc<MetaStore>,
    guard: PathGuard,
    /// Soft cap on registered folders (OS watch descriptors are finite).
    max_folders: usize,
}

impl FolderRegistry {
    pub fn new(meta: Arc<MetaStore>, guard: PathGuard, max_folders: usize) -> Self {
        Self { meta, guard, max_folders }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Register a folder. The path must pass the Path Guard and may not be
    /// the same as, an ancestor of, or a descendant of any registered folder.
    pub fn add(&self, path: &Path, ignores: Vec<String>) -> Result<FolderRecord> {
        let canonical = self.guard.validate(path)?;

        let existing = self.meta.list_folders();
        if existing.len() >= self.max_folders {
            return Err(Error::ResourceExhausted(format!(
                "folder limit reached ({} registered, cap {})",
                existing.len(),
                self.max_folders
            )));
        }
        for folder in &existing {
            let registered = PathBuf::from(&folder.path);
            if canonical == registered {
                return Err(Error::Conflict(format!(
                    "folder '{}' is already registered as {}",
                    canonical.display(),
                    folder.folder_id
                )));
            }
            if canonical.starts_with(&registered) {
                return Err(Error::Conflict(format!(
                    "folder '{}' is nested under registered folder '{}'",
                    canonical.display(),
                    folder.path
                )));
            }
            if registered.starts_with(&canonical) {
                return Err(Error::Conflict(format!(
                    "folder '{}' contains registered folder '{}'",
                    canonical.display(),
                    folder.path
                )));
            }
        }

        let record = FolderRecord {
            folder_id: Uuid::new_v4().to_string(),
            path: canonical.display().to_string(),
            status: FolderState::Active,
            created_at: now_millis(),
            last_scan_at: None,
            file_count: 0,
            chunk_count: 0,
            last_error: None,
            ignores,
        };
        self.meta.insert_folder(record.clone())?;
        tracing::info!(folder = record.folder_id.as_str(), path = record.path.as_str(), "Folder registered");
        Ok(record)
    }

    /// Delete the folder record with all of its files and chunks. Vector
    /// points are the caller's responsibility (metadata deletions first).
    pub fn remove(&self, folder_id: &str) -> Result<(usize, usize)> {
        if self.meta.get_folder(folder_id).is_none() {
            return Err(Error::NotFound(format!("unknown folderId '{folder_id}'")));
        }
        let (files, chunks) = self.meta.delete_cascade(folder_id);
        tracing::info!(folder = folder_id, files, chunks, "Folder removed");
        Ok((files, chunks))
    }

    pub fn pause(&self, folder_id: &str) -> Result<FolderRecord> {
        self.set_state(folder_id, FolderState::Paused)
    }

    pub fn resume(&self, folder_id: &str) -> Result<FolderRecord> {
        self.set_state(folder_id, FolderState::Active)
    }

    fn set_state(&self, folder_id: &str, state: FolderState) -> Result<FolderRecord> {
        let mut folder = self
            .meta
            .get_folder(folder_id)
            .ok_or_else(|| Error::NotFound(format!("unknown folderId '{folder_id}'")))?;
        folder.status = state;
        if state == FolderState::Active {
            folder.last_error = None;
        }
        self.meta.update_folder(folder.clone());
        Ok(folder)
    }

    /// Transition a folder to the error state, keeping its data.
    pub fn mark_error(&self, folder_id: &str, message: &str) {
        self.meta.with_folder(folder_id, |folder| {
            folder.status = FolderState::Error;
            folder.last_error = Some(message.to_string());
        });
    }

    pub fn get(&self, folder_id: &str) -> Result<FolderRecord> {
        self.meta
            .get_folder(folder_id)
            .ok_or_else(|| Error::NotFound(format!("unknown folderId '{folder_id}'")))
    }

    pub fn list(&self) -> Vec<FolderRecord> {
        self.meta.list_folders()
    }

    /// Resolve a folder from either an id or a path, as the tool surface
    /// accepts both.
    pub fn resolve(&self, folder_id: Option<&str>, folder_path: Option<&str>) -> Result<FolderRecord> {
        if let Some(id) = folder_id {
            return self.get(id);
        }
        if let Some(path) = folder_path {
            let canonical = std::fs::canonicalize(path)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.to_string());
            return self
                .meta
                .folder_by_path(&canonical)
                .or_else(|| self.meta.folder_by_path(path))
                .ok_or_else(|| Error::NotFound(format!("no folder registered at '{path}'")));
        }
        Err(Error::InvalidArgument("folderId or folderPath is required".to_string()))
    }

    /// Re-check persisted folders against the Path Guard at startup. A
    /// folder that no longer passes is kept but transitioned to the error
    /// state so it is never scanned or watched.
    pub fn revalidate_persisted(&self) {
        for folder in self.meta.list_folders() {
            if let Err(err) = self.guard.validate(Path::new(&folder.path)) {
                tracing::warn!(folder = folder.folder_id.as_str(), path = folder.path.as_str(), error = %err, "Persisted folder failed path validation");
                self.mark_error(&folder.folder_id, &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry_with_root(root: &Path) -> FolderRegistry {
        let config = Config {
            allowed_prefixes: vec![root.display().to_string()],
            ..Config::default()
        };
        FolderRegistry::new(Arc::new(MetaStore::in_memory()), PathGuard::new(&config), 8)
    }

    fn mkdirs(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn add_then_list_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        let project = mkdirs(&root, "dev/proj");
        let folder = registry.add(&project, vec![]).unwrap();
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].folder_id, folder.folder_id);
        assert_eq!(listed[0].status, FolderState::Active);
    }

    #[test]
    fn nested_folders_conflict_both_directions() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        let parent = mkdirs(&root, "dev/proj");
        let child = mkdirs(&root, "dev/proj/sub");
        registry.add(&parent, vec![]).unwrap();

        let err = registry.add(&child, vec![]).unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // And the ancestor of a registered folder conflicts too.
        let registry2 = registry_with_root(&root);
        registry2.add(&child, vec![]).unwrap();
        let err = registry2.add(&parent, vec![]).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn duplicate_add_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        let project = mkdirs(&root, "dev/proj");
        registry.add(&project, vec![]).unwrap();
        let err = registry.add(&project, vec![]).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn folder_cap_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let config = Config {
            allowed_prefixes: vec![root.display().to_string()],
            ..Config::default()
        };
        let registry =
            FolderRegistry::new(Arc::new(MetaStore::in_memory()), PathGuard::new(&config), 1);
        registry.add(&mkdirs(&root, "a/one"), vec![]).unwrap();
        let err = registry.add(&mkdirs(&root, "b/two"), vec![]).unwrap_err();
        assert_eq!(err.kind(), "resource_exhausted");
    }

    #[test]
    fn pause_resume_toggle_state() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        let folder = registry.add(&mkdirs(&root, "dev/proj"), vec![]).unwrap();
        let paused = registry.pause(&folder.folder_id).unwrap();
        assert_eq!(paused.status, FolderState::Paused);
        let resumed = registry.resume(&folder.folder_id).unwrap();
        assert_eq!(resumed.status, FolderState::Active);
    }

    #[test]
    fn resolve_by_path_and_id() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        let project = mkdirs(&root, "dev/proj");
        let folder = registry.add(&project, vec![]).unwrap();
        assert_eq!(
            registry.resolve(Some(&folder.folder_id), None).unwrap().folder_id,
            folder.folder_id
        );
        assert_eq!(
            registry
                .resolve(None, Some(project.to_str().unwrap()))
                .unwrap()
                .folder_id,
            folder.folder_id
        );
        assert_eq!(registry.resolve(None, None).unwrap_err().kind(), "invalid_argument");
        assert_eq!(registry.resolve(Some("nope"), None).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn persisted_forbidden_folders_are_quarantined_at_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let meta = Arc::new(MetaStore::in_memory());
        // A record that predates the current allowlist (e.g. config change
        // across a restart) and no longer passes the guard.
        meta.insert_folder(FolderRecord {
            folder_id: "stale".to_string(),
            path: "/usr/share/doc".to_string(),
            status: FolderState::Active,
            created_at: now_millis(),
            last_scan_at: None,
            file_count: 0,
            chunk_count: 0,
            last_error: None,
            ignores: vec![],
        })
        .unwrap();

        let config = Config {
            allowed_prefixes: vec![root.display().to_string()],
            ..Config::default()
        };
        let registry = FolderRegistry::new(Arc::clone(&meta), PathGuard::new(&config), 8);
        registry.revalidate_persisted();

        let folder = registry.get("stale").unwrap();
        assert_eq!(folder.status, FolderState::Error);
        assert!(folder.last_error.is_some());
    }

    #[test]
    fn unknown_folder_operations_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let registry = registry_with_root(&root);
        assert_eq!(registry.remove("missing").unwrap_err().kind(), "not_found");
        assert_eq!(registry.pause("missing").unwrap_err().kind(), "not_found");
    }
}
