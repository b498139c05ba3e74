//! Metadata store adapter. Document collections `folders`, `files`, and
//! `chunks` with the unique indexes the data model requires, held in
//! concurrent maps with optional JSON persistence (temp-file + rename per
//! collection). Operations are idempotent; there are no transactions, and
//! a crash between writes is repaired by the next scan.

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    Active,
    Paused,
    Error,
}

/// A registered indexing root. Owned by the Folder Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub folder_id: String,
    /// Absolute, canonical, guard-validated.
    pub path: String,
    pub status: FolderState,
    pub created_at: u64,
    pub last_scan_at: Option<u64>,
    pub file_count: u64,
    pub chunk_count: u64,
    pub last_error: Option<String>,
    /// Per-folder scanner overrides: extra directory/file names to skip.
    #[serde(default)]
    pub ignores: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Indexing,
    Indexed,
    Failed,
    Skipped,
    Deleted,
}

/// One file under a registered folder. `(folderId, relativePath)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub folder_id: String,
    pub relative_path: String,
    pub size: u64,
    pub modified_at: u64,
    pub content_hash: String,
    pub language: Option<String>,
    pub chunk_count: u64,
    pub indexed_at: Option<u64>,
    pub state: FileState,
    pub last_error: Option<String>,
}

/// One chunk row. `chunkId` is unique and content-derived, so re-indexing
/// unchanged content writes the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_id: String,
    pub folder_id: String,
    pub relative_path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub content: String,
    pub content_hash: String,
    pub token_estimate: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Concurrent document store with unique-index enforcement.
pub struct MetaStore {
    folders: DashMap<String, FolderRecord>,
    files: DashMap<String, FileRecord>,
    /// `(folderId, relativePath)` unique index → fileId.
    file_index: DashMap<String, String>,
    chunks: DashMap<String, ChunkRecord>,
    /// fileId → chunkIds, maintained alongside `chunks`.
    chunk_index: DashMap<String, HashSet<String>>,
    persist_dir: Option<PathBuf>,
}

fn file_key(folder_id: &str, relative_path: &str) -> String {
    format!("{folder_id}\n{relative_path}")
}

impl MetaStore {
    /// Open the store, loading any persisted collections from `persist_dir`.
    pub fn open(persist_dir: Option<PathBuf>) -> Result<Self> {
        let store = Self {
            folders: DashMap::new(),
            files: DashMap::new(),
            file_index: DashMap::new(),
            chunks: DashMap::new(),
            chunk_index: DashMap::new(),
            persist_dir,
        };
        store.load()?;
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            folders: DashMap::new(),
            files: DashMap::new(),
            file_index: DashMap::new(),
            chunks: DashMap::new(),
            chunk_index: DashMap::new(),
            persist_dir: None,
        }
    }

    // -- folders ------------------------------------------------------------

    /// Insert a new folder. Unique on `path`.
    pub fn insert_folder(&self, folder: FolderRecord) -> Result<()> {
        if self.folder_by_path(&folder.path).is_some() {
            return Err(Error::Conflict(format!("folder '{}' already registered", folder.path)));
        }
        self.folders.insert(folder.folder_id.clone(), folder);
        self.persist_folders();
        Ok(())
    }

    pub fn update_folder(&self, folder: FolderRecord) {
        self.folders.insert(folder.folder_id.clone(), folder);
        self.persist_folders();
    }

    pub fn get_folder(&self, folder_id: &str) -> Option<FolderRecord> {
        self.folders.get(folder_id).map(|f| f.clone())
    }

    pub fn folder_by_path(&self, path: &str) -> Option<FolderRecord> {
        self.folders.iter().find(|f| f.path == path).map(|f| f.clone())
    }

    pub fn list_folders(&self) -> Vec<FolderRecord> {
        let mut folders: Vec<FolderRecord> = self.folders.iter().map(|f| f.clone()).collect();
        folders.sort_by(|a, b| a.path.cmp(&b.path));
        folders
    }

    /// Mutate one folder record in place, if present.
    pub fn with_folder<F: FnOnce(&mut FolderRecord)>(&self, folder_id: &str, f: F) {
        if let Some(mut folder) = self.folders.get_mut(folder_id) {
            f(&mut folder);
        }
        self.persist_folders();
    }

    // -- files --------------------------------------------------------------

    /// Insert or replace a file record, enforcing `(folderId, relativePath)`
    /// uniqueness. An existing record for the same path keeps its fileId.
    pub fn upsert_file(&self, mut file: FileRecord) -> FileRecord {
        let key = file_key(&file.folder_id, &file.relative_path);
        if let Some(existing_id) = self.file_index.get(&key).map(|id| id.clone()) {
            file.file_id = existing_id;
        }
        self.file_index.insert(key, file.file_id.clone());
        self.files.insert(file.file_id.clone(), file.clone());
        file
    }

    pub fn get_file(&self, file_id: &str) -> Option<FileRecord> {
        self.files.get(file_id).map(|f| f.clone())
    }

    pub fn file_by_path(&self, folder_id: &str, relative_path: &str) -> Option<FileRecord> {
        let id = self.file_index.get(&file_key(folder_id, relative_path))?.clone();
        self.get_file(&id)
    }

    pub fn files_by_folder(&self, folder_id: &str) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> =
            self.files.iter().filter(|f| f.folder_id == folder_id).map(|f| f.clone()).collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files
    }

    pub fn delete_file(&self, file_id: &str) -> Option<FileRecord> {
        let (_, file) = self.files.remove(file_id)?;
        self.file_index.remove(&file_key(&file.folder_id, &file.relative_path));
        Some(file)
    }

    // -- chunks -------------------------------------------------------------

    pub fn upsert_chunk(&self, chunk: ChunkRecord) {
        if let Some(previous) = self.chunks.insert(chunk.chunk_id.clone(), chunk.clone()) {
            if previous.file_id != chunk.file_id {
                if let Some(mut ids) = self.chunk_index.get_mut(&previous.file_id) {
                    ids.remove(&previous.chunk_id);
                }
            }
        }
        self.chunk_index.entry(chunk.file_id.clone()).or_default().insert(chunk.chunk_id);
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.chunks.get(chunk_id).map(|c| c.clone())
    }

    pub fn chunk_exists(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn chunk_ids_by_file(&self, file_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .chunk_index
            .get(file_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn delete_chunks(&self, chunk_ids: &[String]) -> usize {
        let mut removed = 0;
        for id in chunk_ids {
            if let Some((_, chunk)) = self.chunks.remove(id) {
                if let Some(mut ids) = self.chunk_index.get_mut(&chunk.file_id) {
                    ids.remove(id);
                }
                removed += 1;
            }
        }
        removed
    }

    // -- cascade ------------------------------------------------------------

    /// Delete a folder with everything under it. Returns
    /// `(files_removed, chunks_removed)`.
    pub fn delete_cascade(&self, folder_id: &str) -> (usize, usize) {
        let files = self.files_by_folder(folder_id);
        let mut chunks_removed = 0;
        for file in &files {
            let chunk_ids = self.chunk_ids_by_file(&file.file_id);
            chunks_removed += self.delete_chunks(&chunk_ids);
            self.chunk_index.remove(&file.file_id);
            self.delete_file(&file.file_id);
        }
        self.folders.remove(folder_id);
        self.persist_folders();
        self.flush();
        (files.len(), chunks_removed)
    }

    // -- persistence ---------------------------------------------------------

    fn load(&self) -> Result<()> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Internal(format!("create {}: {e}", dir.display())))?;
            return Ok(());
        }
        if let Some(folders) = read_collection::<FolderRecord>(&dir.join("folders.json"))? {
            for folder in folders {
                self.folders.insert(folder.folder_id.clone(), folder);
            }
        }
        if let Some(files) = read_collection::<FileRecord>(&dir.join("files.json"))? {
            for file in files {
                self.file_index
                    .insert(file_key(&file.folder_id, &file.relative_path), file.file_id.clone());
                self.files.insert(file.file_id.clone(), file);
            }
        }
        if let Some(chunks) = read_collection::<ChunkRecord>(&dir.join("chunks.json"))? {
            for chunk in chunks {
                self.chunk_index
                    .entry(chunk.file_id.clone())
                    .or_default()
                    .insert(chunk.chunk_id.clone());
                self.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
        }
        Ok(())
    }

    fn persist_folders(&self) {
        if let Some(dir) = &self.persist_dir {
            let folders = self.list_folders();
            write_collection(&dir.join("folders.json"), &folders);
        }
    }

    /// Persist `files` and `chunks`. Called at job boundaries; the store is
    /// usable without a persist dir (tests, ephemeral deployments).
    pub fn flush(&self) {
        let Some(dir) = &self.persist_dir else { return };
        let mut files: Vec<FileRecord> = self.files.iter().map(|f| f.clone()).collect();
        files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        write_collection(&dir.join("files.json"), &files);
        let mut chunks: Vec<ChunkRecord> = self.chunks.iter().map(|c| c.clone()).collect();
        chunks.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        write_collection(&dir.join("chunks.json"), &chunks);
    }
}

fn read_collection<T: for<'de> Deserialize<'de>>(path: &std::path::Path) -> Result<Option<Vec<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("read {}: {e}", path.display())))?;
    let items = serde_json::from_str(&raw)
        .map_err(|e| Error::Internal(format!("parse {}: {e}", path.display())))?;
    Ok(Some(items))
}

/// Atomic write: serialize next to the target, then rename over it.
fn write_collection<T: Serialize>(path: &std::path::Path, items: &[T]) {
    let tmp = path.with_extension("json.tmp");
    match serde_json::to_vec(items) {
        Ok(bytes) => {
            if let Err(e) =
                std::fs::write(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, path))
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist collection");
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to serialize collection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, path: &str) -> FolderRecord {
        FolderRecord {
            folder_id: id.to_string(),
            path: path.to_string(),
            status: FolderState::Active,
            created_at: now_millis(),
            last_scan_at: None,
            file_count: 0,
            chunk_count: 0,
            last_error: None,
            ignores: Vec::new(),
        }
    }

    fn file(id: &str, folder_id: &str, rel: &str) -> FileRecord {
        FileRecord {
            file_id: id.to_string(),
            folder_id: folder_id.to_string(),
            relative_path: rel.to_string(),
            size: 10,
            modified_at: 1,
            content_hash: "h".to_string(),
            language: None,
            chunk_count: 0,
            indexed_at: None,
            state: FileState::Pending,
            last_error: None,
        }
    }

    fn chunk(id: &str, file_id: &str, folder_id: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            file_id: file_id.to_string(),
            folder_id: folder_id.to_string(),
            relative_path: "a.rs".to_string(),
            chunk_index: 0,
            start_line: 1,
            end_line: 5,
            byte_start: 0,
            byte_end: 100,
            content: "fn a() {}".to_string(),
            content_hash: "h".to_string(),
            token_estimate: 3,
        }
    }

    #[test]
    fn folder_path_is_unique() {
        let store = MetaStore::in_memory();
        store.insert_folder(folder("f1", "/home/dev/a")).unwrap();
        let err = store.insert_folder(folder("f2", "/home/dev/a")).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn file_upsert_keeps_id_for_same_path() {
        let store = MetaStore::in_memory();
        let first = store.upsert_file(file("a", "f1", "src/lib.rs"));
        let second = store.upsert_file(file("b", "f1", "src/lib.rs"));
        assert_eq!(first.file_id, second.file_id);
        assert_eq!(store.files_by_folder("f1").len(), 1);
    }

    #[test]
    fn cascade_removes_files_and_chunks() {
        let store = MetaStore::in_memory();
        store.insert_folder(folder("f1", "/home/dev/a")).unwrap();
        store.upsert_file(file("a", "f1", "one.rs"));
        store.upsert_chunk(chunk("c1", "a", "f1"));
        store.upsert_chunk(chunk("c2", "a", "f1"));
        let (files, chunks) = store.delete_cascade("f1");
        assert_eq!((files, chunks), (1, 2));
        assert!(store.get_folder("f1").is_none());
        assert!(store.files_by_folder("f1").is_empty());
        assert!(!store.chunk_exists("c1"));
    }

    #[test]
    fn chunk_index_tracks_file_ownership() {
        let store = MetaStore::in_memory();
        store.upsert_chunk(chunk("c1", "a", "f1"));
        store.upsert_chunk(chunk("c2", "a", "f1"));
        assert_eq!(store.chunk_ids_by_file("a").len(), 2);
        store.delete_chunks(&["c1".to_string()]);
        assert_eq!(store.chunk_ids_by_file("a"), vec!["c2".to_string()]);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MetaStore::open(Some(dir.path().to_path_buf())).unwrap();
            store.insert_folder(folder("f1", "/home/dev/a")).unwrap();
            store.upsert_file(file("a", "f1", "one.rs"));
            store.upsert_chunk(chunk("c1", "a", "f1"));
            store.flush();
        }
        let reopened = MetaStore::open(Some(dir.path().to_path_buf())).unwrap();
        assert!(reopened.get_folder("f1").is_some());
        assert!(reopened.file_by_path("f1", "one.rs").is_some());
        assert!(reopened.chunk_exists("c1"));
        assert_eq!(reopened.chunk_ids_by_file("a"), vec!["c1".to_string()]);
    }
}
