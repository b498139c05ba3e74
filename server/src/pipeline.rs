//! Indexing pipeline. Consumes [`IndexJob`]s from per-folder FIFO queues and
//! drives scan → diff → chunk → embed → upsert with bounded concurrency.
//!
//! Write ordering is strict: vector upserts precede chunk-row writes for
//! additions, and chunk-row deletions precede vector deletions for removals.
//! A crash can therefore only leave orphan vectors, which the next scan
//! repairs; the metadata never claims a chunk whose vector is absent.

use crate::chunk::{chunk_text, detect_language, is_binary, ChunkPolicy};
use crate::config::Config;
use crate::diff::diff_sets;
use crate::embed::{with_retries, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::hash::{chunk_id, hash_bytes};
use crate::meta::{now_millis, ChunkRecord, FileRecord, FileState, FolderRecord, FolderState, MetaStore};
use crate::scan::{scan_folder, DiskFile};
use crate::status::{FolderCounters, Phase, StatusAggregator};
use crate::vector::{PointPayload, VectorPoint, VectorStore};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum JobKind {
    FullScan,
    /// Re-index one file, or mini-scan one subtree, identified by its
    /// absolute path.
    Incremental { target: PathBuf },
    DeleteFile { target: PathBuf },
    DeleteFolder,
}

/// Unit of pipeline work. Durable only via its effects; consumed exactly
/// once by the owning folder's worker.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub job_id: String,
    pub folder_id: String,
    pub kind: JobKind,
    pub created_at: u64,
    pub attempt: u32,
}

impl IndexJob {
    pub fn new(folder_id: &str, kind: JobKind) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            folder_id: folder_id.to_string(),
            kind,
            created_at: now_millis(),
            attempt: 0,
        }
    }
}

/// Job attempts after the first, when the job itself failed to run.
const JOB_MAX_ATTEMPTS: u32 = 3;

/// How long the embed batcher waits for more chunks before flushing a
/// partial batch.
const BATCH_LINGER: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: Config,
    policy: ChunkPolicy,
    meta: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    status: Arc<StatusAggregator>,
    /// One FIFO queue per folder; the sender is dropped on removal.
    queues: DashMap<String, mpsc::Sender<IndexJob>>,
    /// Per-folder cancellation, children of the shutdown token.
    cancels: DashMap<String, CancellationToken>,
    /// Gates how many folder jobs run at once.
    folder_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: Config,
        meta: Arc<MetaStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        status: Arc<StatusAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy: ChunkPolicy::from_config(&config),
            folder_permits: Arc::new(Semaphore::new(config.folder_concurrency)),
            config,
            meta,
            vectors,
            embedder,
            status,
            queues: DashMap::new(),
            cancels: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop all folder workers. In-flight embedding batches observe the
    /// cancellation through their child tokens.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Enqueue a job for its folder. Non-blocking: a full queue returns
    /// `resource_exhausted` to the caller instead of waiting.
    pub fn submit(self: &Arc<Self>, job: IndexJob) -> Result<String> {
        let folder = self
            .meta
            .get_folder(&job.folder_id)
            .ok_or_else(|| Error::NotFound(format!("unknown folderId '{}'", job.folder_id)))?;
        if folder.status == FolderState::Paused {
            return Err(Error::Conflict(format!(
                "folder '{}' is paused; resume it before scanning",
                folder.folder_id
            )));
        }
        self.enqueue(job)
    }

    fn enqueue(self: &Arc<Self>, job: IndexJob) -> Result<String> {
        let folder_id = job.folder_id.clone();
        let job_id = job.job_id.clone();
        // Two passes: a closed channel means the worker exited (folder
        // removed and re-added); recreate it once.
        for _ in 0..2 {
            let sender = self
                .queues
                .entry(folder_id.clone())
                .or_insert_with(|| self.spawn_worker(&folder_id))
                .clone();
            match sender.try_send(job.clone()) {
                Ok(()) => {
                    self.status.counters(&folder_id).queue_inc();
                    return Ok(job_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(Error::ResourceExhausted(format!(
                        "job queue for folder '{folder_id}' is full ({} slots)",
                        self.config.job_queue_depth
                    )));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.queues.remove(&folder_id);
                }
            }
        }
        Err(Error::Internal(format!("job queue for folder '{folder_id}' is unavailable")))
    }

    fn spawn_worker(self: &Arc<Self>, folder_id: &str) -> mpsc::Sender<IndexJob> {
        let (tx, rx) = mpsc::channel(self.config.job_queue_depth);
        let cancel = self.shutdown.child_token();
        self.cancels.insert(folder_id.to_string(), cancel.clone());
        let pipeline = Arc::clone(self);
        let folder_id = folder_id.to_string();
        tokio::spawn(async move {
            pipeline.folder_worker(folder_id, rx, cancel).await;
        });
        tx
    }

    /// One job at a time per folder, FIFO. Jobs across folders run in
    /// parallel up to `folderConcurrency`.
    async fn folder_worker(
        self: Arc<Self>,
        folder_id: String,
        mut rx: mpsc::Receiver<IndexJob>,
        cancel: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                () = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let counters = self.status.counters(&folder_id);
            counters.queue_dec();

            let Some(folder) = self.meta.get_folder(&folder_id) else {
                // Folder removed while the job was queued; drop it.
                continue;
            };
            // Paused folders halt queued jobs; error-state folders still run
            // explicit scans (only their watcher is broken).
            if folder.status == FolderState::Paused {
                tracing::debug!(folder = folder_id.as_str(), job = job.job_id.as_str(), "Skipping job for paused folder");
                continue;
            }

            let Ok(_permit) = self.folder_permits.acquire().await else { break };
            let ran = tokio::select! {
                () = cancel.cancelled() => false,
                result = self.run_job(&folder, &job, &cancel) => {
                    if let Err(err) = result {
                        self.handle_job_failure(&folder, &job, err);
                    }
                    true
                }
            };
            if !ran {
                break;
            }
        }
    }

    fn handle_job_failure(self: &Arc<Self>, folder: &FolderRecord, job: &IndexJob, err: Error) {
        let counters = self.status.counters(&folder.folder_id);
        counters.record_error(&err.to_string());
        if err.is_transient() && job.attempt + 1 < JOB_MAX_ATTEMPTS {
            let mut retry = job.clone();
            retry.attempt += 1;
            tracing::warn!(folder = folder.folder_id.as_str(), job = job.job_id.as_str(), attempt = retry.attempt, error = %err, "Rescheduling failed job");
            let _ = self.enqueue(retry);
        } else {
            tracing::warn!(folder = folder.folder_id.as_str(), job = job.job_id.as_str(), error = %err, "Job failed");
            self.meta.with_folder(&folder.folder_id, |f| {
                f.last_error = Some(err.to_string());
            });
        }
    }

    async fn run_job(
        self: &Arc<Self>,
        folder: &FolderRecord,
        job: &IndexJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(job = job.job_id.as_str(), folder = folder.folder_id.as_str(), "Job started");
        let result = match &job.kind {
            JobKind::FullScan => self.run_scan(folder, None, cancel).await,
            JobKind::Incremental { target } => {
                if target.is_dir() {
                    let prefix = relative_to(target, Path::new(&folder.path));
                    self.run_scan(folder, prefix, cancel).await
                } else {
                    self.run_single_file(folder, target, cancel).await
                }
            }
            JobKind::DeleteFile { target } => self.run_delete_file(folder, target).await,
            JobKind::DeleteFolder => {
                self.purge_folder_data(&folder.folder_id).await;
                Ok(())
            }
        };
        self.meta.flush();
        result
    }

    // -- scan jobs ----------------------------------------------------------

    async fn run_scan(
        self: &Arc<Self>,
        folder: &FolderRecord,
        subtree: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let counters = self.status.counters(&folder.folder_id);
        counters.set_phase(Phase::Scanning);
        let started = std::time::Instant::now();

        let root = PathBuf::from(&folder.path);
        let ignores = folder.ignores.clone();
        let scan_root = root.clone();
        let mut disk = tokio::task::spawn_blocking(move || scan_folder(&scan_root, &ignores))
            .await
            .map_err(Error::internal)??;
        if let Some(prefix) = &subtree {
            disk.retain(|f| f.relative_path.starts_with(prefix.as_str()));
        }

        let mut indexed = self.meta.files_by_folder(&folder.folder_id);
        if let Some(prefix) = &subtree {
            indexed.retain(|f| f.relative_path.starts_with(prefix.as_str()));
        }

        let diff_root = root.clone();
        let changes = tokio::task::spawn_blocking(move || diff_sets(&diff_root, &disk, &indexed))
            .await
            .map_err(Error::internal)?;

        counters.begin_job((changes.to_add.len() + changes.to_update.len()) as u64);
        tracing::info!(
            folder = folder.folder_id.as_str(),
            add = changes.to_add.len(),
            update = changes.to_update.len(),
            delete = changes.to_delete.len(),
            refresh = changes.refreshed.len(),
            "Scan diff computed"
        );

        // Removals first, so searches stop surfacing dead files promptly.
        for record in &changes.to_delete {
            self.delete_indexed_file(record, &counters).await?;
        }

        for (record, disk_file) in &changes.refreshed {
            let mut updated = record.clone();
            updated.size = disk_file.size;
            updated.modified_at = disk_file.modified_at;
            self.meta.upsert_file(updated);
        }

        // Adds and updates share one embed batcher so provider batches fill
        // across file boundaries.
        let work: Vec<DiskFile> =
            changes.to_add.iter().chain(changes.to_update.iter()).cloned().collect();
        if !work.is_empty() {
            let (batcher_tx, batcher_handle) = self.spawn_batcher(cancel.clone());
            let file_permits = Arc::new(Semaphore::new(self.config.file_concurrency));
            let mut tasks: JoinSet<()> = JoinSet::new();
            for disk_file in work {
                let Ok(permit) = Arc::clone(&file_permits).acquire_owned().await else { break };
                let pipeline = Arc::clone(self);
                let folder = folder.clone();
                let counters = Arc::clone(&counters);
                let batcher = batcher_tx.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    pipeline.process_file(&folder, &disk_file, &batcher, &counters, &cancel).await;
                });
            }
            drop(batcher_tx);
            while tasks.join_next().await.is_some() {}
            let _ = batcher_handle.await;
        }

        counters.set_phase(Phase::Idle);
        self.refresh_folder_stats(&folder.folder_id, true);
        tracing::info!(
            folder = folder.folder_id.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(())
    }

    async fn run_single_file(
        self: &Arc<Self>,
        folder: &FolderRecord,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(relative) = relative_to(target, Path::new(&folder.path)) else {
            return Err(Error::InvalidArgument(format!(
                "'{}' is outside folder '{}'",
                target.display(),
                folder.path
            )));
        };
        let counters = self.status.counters(&folder.folder_id);
        counters.set_phase(Phase::Indexing);
        let disk_file = DiskFile { relative_path: relative, size: 0, modified_at: 0 };
        let (batcher_tx, batcher_handle) = self.spawn_batcher(cancel.clone());
        self.process_file(folder, &disk_file, &batcher_tx, &counters, cancel).await;
        drop(batcher_tx);
        let _ = batcher_handle.await;
        counters.set_phase(Phase::Idle);
        self.refresh_folder_stats(&folder.folder_id, false);
        Ok(())
    }

    async fn run_delete_file(self: &Arc<Self>, folder: &FolderRecord, target: &Path) -> Result<()> {
        let Some(relative) = relative_to(target, Path::new(&folder.path)) else {
            return Ok(());
        };
        let Some(record) = self.meta.file_by_path(&folder.folder_id, &relative) else {
            return Ok(());
        };
        let counters = self.status.counters(&folder.folder_id);
        self.delete_indexed_file(&record, &counters).await?;
        self.refresh_folder_stats(&folder.folder_id, false);
        Ok(())
    }

    /// Remove one file from both stores. Chunk rows go first; a crash after
    /// that leaves orphan vectors, which the next scan's reindex repairs.
    async fn delete_indexed_file(
        self: &Arc<Self>,
        record: &FileRecord,
        counters: &Arc<FolderCounters>,
    ) -> Result<()> {
        let mut tombstone = record.clone();
        tombstone.state = FileState::Deleted;
        self.meta.upsert_file(tombstone);

        let chunk_ids = self.meta.chunk_ids_by_file(&record.file_id);
        let removed = self.meta.delete_chunks(&chunk_ids);
        counters.sub_chunks(removed as u64);

        with_retries(self.config.embed_max_retries, &self.shutdown, || {
            let vectors = Arc::clone(&self.vectors);
            let ids = chunk_ids.clone();
            async move { vectors.delete(&ids).await }
        })
        .await?;

        self.meta.delete_file(&record.file_id);
        tracing::debug!(file = record.relative_path.as_str(), chunks = removed, "File removed from index");
        Ok(())
    }

    /// Cascade used by delete_folder jobs: metadata first, vectors second.
    pub async fn purge_folder_data(&self, folder_id: &str) -> (usize, usize) {
        let counts = self.meta.delete_cascade(folder_id);
        self.purge_folder_vectors(folder_id).await;
        counts
    }

    /// Drop a removed folder's vector points and status counters. The
    /// metadata rows must already be gone, so a failure here strands
    /// orphan vectors only; a repair pass or re-add cleans them up.
    pub async fn purge_folder_vectors(&self, folder_id: &str) {
        if let Err(err) = self.vectors.delete_by_folder(folder_id).await {
            tracing::warn!(folder = folder_id, error = %err, "Vector cascade delete failed");
        }
        self.status.remove(folder_id);
    }

    /// Cancel all in-flight and queued work for a folder.
    pub fn cancel_folder(&self, folder_id: &str) {
        if let Some((_, cancel)) = self.cancels.remove(folder_id) {
            cancel.cancel();
        }
        self.queues.remove(folder_id);
    }

    fn refresh_folder_stats(&self, folder_id: &str, scanned: bool) {
        let files = self.meta.files_by_folder(folder_id);
        let file_count = files.iter().filter(|f| f.state != FileState::Deleted).count() as u64;
        let chunk_count = files.iter().map(|f| f.chunk_count).sum();
        self.meta.with_folder(folder_id, |folder| {
            folder.file_count = file_count;
            folder.chunk_count = chunk_count;
            if scanned {
                folder.last_scan_at = Some(now_millis());
            }
        });
    }

    // -- per-file protocol ----------------------------------------------------

    async fn process_file(
        self: &Arc<Self>,
        folder: &FolderRecord,
        disk_file: &DiskFile,
        batcher: &mpsc::Sender<EmbedRequest>,
        counters: &Arc<FolderCounters>,
        cancel: &CancellationToken,
    ) {
        match self.index_file(folder, &disk_file.relative_path, batcher, counters, cancel).await {
            Ok(FileOutcome::Indexed { chunks }) => {
                counters.inc_indexed();
                tracing::debug!(file = disk_file.relative_path.as_str(), chunks, "File indexed");
            }
            Ok(FileOutcome::Unchanged) => counters.inc_indexed(),
            Ok(FileOutcome::Skipped { reason }) => {
                counters.inc_skipped();
                tracing::debug!(file = disk_file.relative_path.as_str(), reason, "File skipped");
            }
            Ok(FileOutcome::Missing) => counters.inc_skipped(),
            Err(err) => {
                counters.inc_failed(&err.to_string());
                if let Some(record) =
                    self.meta.file_by_path(&folder.folder_id, &disk_file.relative_path)
                {
                    let mut failed = record;
                    failed.state = FileState::Failed;
                    failed.last_error = Some(err.to_string());
                    self.meta.upsert_file(failed);
                }
                tracing::warn!(file = disk_file.relative_path.as_str(), error = %err, "File failed to index");
            }
        }
    }

    async fn index_file(
        self: &Arc<Self>,
        folder: &FolderRecord,
        relative_path: &str,
        batcher: &mpsc::Sender<EmbedRequest>,
        counters: &Arc<FolderCounters>,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let root = Path::new(&folder.path);
        let abs_path = root.join(relative_path);

        let metadata = match tokio::fs::metadata(&abs_path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileOutcome::Missing);
            }
            Err(err) => return Err(Error::Internal(format!("stat {relative_path}: {err}"))),
        };
        let size = metadata.len();
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let existing = self.meta.file_by_path(&folder.folder_id, relative_path);

        if size > self.config.max_file_bytes {
            self.record_skip(folder, relative_path, size, modified_at, &existing, "skipped_large");
            return Ok(FileOutcome::Skipped { reason: "skipped_large" });
        }

        let bytes = match tokio::fs::read(&abs_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileOutcome::Missing);
            }
            Err(err) => return Err(Error::Internal(format!("read {relative_path}: {err}"))),
        };
        if is_binary(&bytes) {
            self.record_skip(folder, relative_path, size, modified_at, &existing, "skipped_binary");
            return Ok(FileOutcome::Skipped { reason: "skipped_binary" });
        }

        let content_hash = hash_bytes(&bytes);

        // Idempotent re-run: unchanged content performs zero embedding calls
        // and zero vector upserts.
        if let Some(record) = &existing {
            if record.content_hash == content_hash && record.state == FileState::Indexed {
                let mut refreshed = record.clone();
                refreshed.size = size;
                refreshed.modified_at = modified_at;
                self.meta.upsert_file(refreshed);
                return Ok(FileOutcome::Unchanged);
            }
        }

        let language = detect_language(relative_path).map(|l| l.to_string());
        let record = self.meta.upsert_file(FileRecord {
            file_id: existing
                .as_ref()
                .map(|e| e.file_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            folder_id: folder.folder_id.clone(),
            relative_path: relative_path.to_string(),
            size,
            modified_at,
            content_hash: content_hash.clone(),
            language: language.clone(),
            chunk_count: 0,
            indexed_at: None,
            state: FileState::Indexing,
            last_error: None,
        });

        let content = String::from_utf8_lossy(&bytes);
        let chunks = chunk_text(&content, &self.policy);
        let new_ids: Vec<String> =
            chunks.iter().map(|c| chunk_id(&content_hash, c.index)).collect();

        let old_ids = self.meta.chunk_ids_by_file(&record.file_id);
        let obsolete: Vec<String> =
            old_ids.into_iter().filter(|id| !new_ids.contains(id)).collect();

        // Embed only chunks whose content-derived id is new to the store;
        // an unchanged chunk is a cache hit.
        let mut pending: Vec<(usize, oneshot::Receiver<Result<Vec<f32>>>)> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if self.meta.chunk_exists(&new_ids[i]) {
                continue;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = EmbedRequest { text: chunk.content.clone(), reply: reply_tx };
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Internal("job cancelled".to_string()));
                }
                sent = batcher.send(request) => {
                    sent.map_err(|_| Error::Internal("embed batcher closed".to_string()))?;
                }
            }
            pending.push((i, reply_rx));
        }

        let mut points = Vec::with_capacity(pending.len());
        for (i, reply_rx) in pending {
            let vector = reply_rx
                .await
                .map_err(|_| Error::Internal("embed batcher dropped reply".to_string()))??;
            let chunk = &chunks[i];
            points.push(VectorPoint {
                id: new_ids[i].clone(),
                vector,
                payload: PointPayload {
                    folder_id: folder.folder_id.clone(),
                    file_id: record.file_id.clone(),
                    relative_path: relative_path.to_string(),
                    chunk_index: chunk.index,
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    language: language.clone(),
                    content_hash: content_hash.clone(),
                },
            });
        }
        let embedded = points.len();

        // Vector writes precede metadata writes for additions.
        if !points.is_empty() {
            with_retries(self.config.embed_max_retries, cancel, || {
                let vectors = Arc::clone(&self.vectors);
                let points = points.clone();
                async move { vectors.upsert(points).await }
            })
            .await?;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            self.meta.upsert_chunk(ChunkRecord {
                chunk_id: new_ids[i].clone(),
                file_id: record.file_id.clone(),
                folder_id: folder.folder_id.clone(),
                relative_path: relative_path.to_string(),
                chunk_index: chunk.index,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                byte_start: chunk.byte_start,
                byte_end: chunk.byte_end,
                content: chunk.content.clone(),
                content_hash: content_hash.clone(),
                token_estimate: chunk.token_estimate,
            });
        }

        // Obsolete chunks: metadata deletions precede vector deletions.
        if !obsolete.is_empty() {
            let removed = self.meta.delete_chunks(&obsolete);
            counters.sub_chunks(removed as u64);
            with_retries(self.config.embed_max_retries, cancel, || {
                let vectors = Arc::clone(&self.vectors);
                let ids = obsolete.clone();
                async move { vectors.delete(&ids).await }
            })
            .await?;
        }

        let mut done = record;
        done.state = FileState::Indexed;
        done.indexed_at = Some(now_millis());
        done.chunk_count = chunks.len() as u64;
        self.meta.upsert_file(done);
        counters.add_chunks(embedded as u64);

        Ok(FileOutcome::Indexed { chunks: chunks.len() })
    }

    fn record_skip(
        &self,
        folder: &FolderRecord,
        relative_path: &str,
        size: u64,
        modified_at: u64,
        existing: &Option<FileRecord>,
        reason: &str,
    ) {
        self.meta.upsert_file(FileRecord {
            file_id: existing
                .as_ref()
                .map(|e| e.file_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            folder_id: folder.folder_id.clone(),
            relative_path: relative_path.to_string(),
            size,
            modified_at,
            content_hash: String::new(),
            language: None,
            chunk_count: 0,
            indexed_at: None,
            state: FileState::Skipped,
            last_error: Some(reason.to_string()),
        });
    }

    // -- embed batcher --------------------------------------------------------

    /// Spawn the job-level batcher that coalesces chunk texts across files
    /// into provider batches bounded by item count and byte budget.
    fn spawn_batcher(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<EmbedRequest>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EmbedRequest>(self.config.embed_batch_max * 2);
        let embedder = Arc::clone(&self.embedder);
        let max_items = self.config.embed_batch_max;
        let max_bytes = self.config.embed_batch_bytes_max;
        let max_retries = self.config.embed_max_retries;

        let handle = tokio::spawn(async move {
            let mut pending: Vec<EmbedRequest> = Vec::new();
            let mut pending_bytes = 0usize;
            let mut inflight: JoinSet<()> = JoinSet::new();

            loop {
                tokio::select! {
                    request = rx.recv() => match request {
                        Some(request) => {
                            if pending.len() + 1 > max_items
                                || (!pending.is_empty()
                                    && pending_bytes + request.text.len() > max_bytes)
                            {
                                flush_batch(&mut pending, &mut pending_bytes, &embedder, max_retries, &cancel, &mut inflight);
                            }
                            pending_bytes += request.text.len();
                            pending.push(request);
                            if pending.len() >= max_items || pending_bytes >= max_bytes {
                                flush_batch(&mut pending, &mut pending_bytes, &embedder, max_retries, &cancel, &mut inflight);
                            }
                        }
                        None => break,
                    },
                    () = tokio::time::sleep(BATCH_LINGER), if !pending.is_empty() => {
                        flush_batch(&mut pending, &mut pending_bytes, &embedder, max_retries, &cancel, &mut inflight);
                    }
                }
            }

            flush_batch(&mut pending, &mut pending_bytes, &embedder, max_retries, &cancel, &mut inflight);
            while inflight.join_next().await.is_some() {}
        });

        (tx, handle)
    }
}

/// One chunk text awaiting embedding, answered through a oneshot.
pub struct EmbedRequest {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

fn flush_batch(
    pending: &mut Vec<EmbedRequest>,
    pending_bytes: &mut usize,
    embedder: &Arc<dyn EmbeddingProvider>,
    max_retries: u32,
    cancel: &CancellationToken,
    inflight: &mut JoinSet<()>,
) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    *pending_bytes = 0;
    let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
    let embedder = Arc::clone(embedder);
    let cancel = cancel.clone();
    inflight.spawn(async move {
        let result = with_retries(max_retries, &cancel, || {
            let embedder = Arc::clone(&embedder);
            let texts = texts.clone();
            async move { embedder.embed(&texts).await }
        })
        .await;
        match result {
            Ok(vectors) => {
                for (request, vector) in batch.into_iter().zip(vectors) {
                    let _ = request.reply.send(Ok(vector));
                }
            }
            Err(err) => {
                for request in batch {
                    let _ = request.reply.send(Err(err.clone()));
                }
            }
        }
    });
}

/// Per-file outcome, aggregated into the folder's counters.
enum FileOutcome {
    Indexed { chunks: usize },
    Unchanged,
    Skipped { reason: &'static str },
    Missing,
}

/// Forward-slash relative path of `target` under `root`, if inside it.
fn relative_to(target: &Path, root: &Path) -> Option<String> {
    target
        .strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|p| !p.is_empty())
}
