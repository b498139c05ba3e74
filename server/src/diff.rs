//! Change tracker. Diffs the on-disk set against the indexed set and emits
//! disjoint add/update/delete work items. `(size, modifiedAt)` is a cheap
//! gate; the content hash is the authoritative identity, computed only for
//! files the gate promotes.

use crate::hash::hash_bytes;
use crate::meta::{FileRecord, FileState};
use crate::scan::DiskFile;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;

/// Work produced by one diff. Every path appears in at most one bucket.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// On disk, not indexed.
    pub to_add: Vec<DiskFile>,
    /// Indexed, but content hash changed.
    pub to_update: Vec<DiskFile>,
    /// Indexed, no longer on disk.
    pub to_delete: Vec<FileRecord>,
    /// `(size, modifiedAt)` moved but bytes did not; only metadata refreshes.
    pub refreshed: Vec<(FileRecord, DiskFile)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_update.is_empty()
            && self.to_delete.is_empty()
            && self.refreshed.is_empty()
    }

    pub fn work_items(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_delete.len()
    }
}

/// Compute the change set for one folder. `root` is the folder's canonical
/// path, used to read bytes for the content check.
pub fn diff_sets(root: &Path, disk: &[DiskFile], indexed: &[FileRecord]) -> ChangeSet {
    let indexed_by_path: HashMap<&str, &FileRecord> = indexed
        .iter()
        .filter(|f| f.state != FileState::Deleted)
        .map(|f| (f.relative_path.as_str(), f))
        .collect();
    let disk_by_path: HashMap<&str, &DiskFile> =
        disk.iter().map(|f| (f.relative_path.as_str(), f)).collect();

    let mut changes = ChangeSet::default();
    // Disk entries whose stat gate tripped; resolved by content hash below.
    let mut candidates: Vec<(&DiskFile, &FileRecord)> = Vec::new();

    for file in disk {
        match indexed_by_path.get(file.relative_path.as_str()) {
            None => changes.to_add.push(file.clone()),
            Some(record) => {
                // A record stuck in-flight (crash between writes) or failed
                // is re-processed unconditionally; the per-file protocol is
                // idempotent, so this restores consistency.
                let in_flight = matches!(
                    record.state,
                    FileState::Pending | FileState::Indexing | FileState::Failed
                );
                if in_flight {
                    changes.to_update.push(file.clone());
                } else if record.size != file.size || record.modified_at != file.modified_at {
                    candidates.push((file, record));
                }
            }
        }
    }

    for record in indexed {
        if record.state == FileState::Deleted {
            continue;
        }
        if !disk_by_path.contains_key(record.relative_path.as_str()) {
            changes.to_delete.push(record.clone());
        }
    }

    // Content check for stat-gated candidates, hashed in parallel.
    let resolved: Vec<(DiskFile, Option<FileRecord>)> = candidates
        .par_iter()
        .map(|(file, record)| {
            let changed = match std::fs::read(root.join(&file.relative_path)) {
                Ok(bytes) => hash_bytes(&bytes) != record.content_hash,
                // Unreadable now; let the pipeline re-stat and decide.
                Err(_) => true,
            };
            if changed {
                ((*file).clone(), None)
            } else {
                ((*file).clone(), Some((*record).clone()))
            }
        })
        .collect();

    for (file, unchanged) in resolved {
        match unchanged {
            None => changes.to_update.push(file),
            Some(record) => changes.refreshed.push((record, file)),
        }
    }

    changes.to_add.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes.to_update.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes.to_delete.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes
}
