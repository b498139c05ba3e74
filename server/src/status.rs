//! Status aggregator. Per-folder progress counters updated atomically by
//! the pipeline; readers take lock-free snapshots and never block writers.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// What a folder's pipeline worker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Scanning = 1,
    Indexing = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Scanning,
            2 => Phase::Indexing,
            _ => Phase::Idle,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Indexing => "indexing",
        }
    }
}

/// Live counters for one folder.
#[derive(Default)]
pub struct FolderCounters {
    files_total: AtomicU64,
    files_indexed: AtomicU64,
    files_failed: AtomicU64,
    files_skipped: AtomicU64,
    chunks_indexed: AtomicU64,
    queue_depth: AtomicU64,
    error_count: AtomicU64,
    phase: AtomicU8,
    last_error: RwLock<Option<String>>,
}

impl FolderCounters {
    /// Reset progress counters at the start of a scan job.
    pub fn begin_job(&self, files_total: u64) {
        self.files_total.store(files_total, Ordering::Relaxed);
        self.files_indexed.store(0, Ordering::Relaxed);
        self.files_failed.store(0, Ordering::Relaxed);
        self.files_skipped.store(0, Ordering::Relaxed);
        self.set_phase(Phase::Indexing);
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn inc_indexed(&self) {
        self.files_indexed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self, error: &str) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().unwrap() = Some(error.to_string());
    }

    pub fn add_chunks(&self, count: u64) {
        self.chunks_indexed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sub_chunks(&self, count: u64) {
        let mut current = self.chunks_indexed.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.chunks_indexed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn queue_inc(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_dec(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(1);
            match self.queue_depth.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn record_error(&self, error: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().unwrap() = Some(error.to_string());
    }
}

/// One folder's status as reported by `code_index_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderStatusSnapshot {
    pub folder_id: String,
    pub phase: &'static str,
    pub files_total: u64,
    pub files_indexed: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub chunks_indexed: u64,
    pub queue_depth: u64,
    pub errors: u64,
    /// 0.0..=1.0 over the current job's file set.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Registry of per-folder counters.
#[derive(Default)]
pub struct StatusAggregator {
    folders: DashMap<String, Arc<FolderCounters>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self, folder_id: &str) -> Arc<FolderCounters> {
        self.folders.entry(folder_id.to_string()).or_default().clone()
    }

    pub fn remove(&self, folder_id: &str) {
        self.folders.remove(folder_id);
    }

    pub fn snapshot(&self, folder_id: &str) -> FolderStatusSnapshot {
        let counters = self.counters(folder_id);
        let total = counters.files_total.load(Ordering::Relaxed);
        let indexed = counters.files_indexed.load(Ordering::Relaxed);
        let failed = counters.files_failed.load(Ordering::Relaxed);
        let skipped = counters.files_skipped.load(Ordering::Relaxed);
        let done = indexed + failed + skipped;
        let phase = Phase::from_u8(counters.phase.load(Ordering::Relaxed));
        let progress = if total == 0 {
            if phase == Phase::Idle {
                1.0
            } else {
                0.0
            }
        } else {
            (done as f64 / total as f64).min(1.0)
        };
        let snapshot = FolderStatusSnapshot {
            folder_id: folder_id.to_string(),
            phase: phase.as_str(),
            files_total: total,
            files_indexed: indexed,
            files_failed: failed,
            files_skipped: skipped,
            chunks_indexed: counters.chunks_indexed.load(Ordering::Relaxed),
            queue_depth: counters.queue_depth.load(Ordering::Relaxed),
            errors: counters.error_count.load(Ordering::Relaxed),
            progress,
            last_error: counters.last_error.read().unwrap().clone(),
        };
        snapshot
    }
}
