//! File watcher for incremental live re-indexing. One notify watcher per
//! active folder streams events into a single debouncer task; quiet paths
//! become incremental or delete jobs for the pipeline. The Path Guard is
//! re-invoked before every watch registration, so a folder that persisted
//! with a forbidden path is refused here regardless of how it got stored.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::PathGuard;
use crate::meta::{FolderRecord, FolderState, MetaStore};
use crate::pipeline::{IndexJob, JobKind, Pipeline};
use crate::scan::is_skipped_dir;
use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// What the notify callbacks push into the debouncer.
enum WatchSignal {
    Event { folder_id: String, path: PathBuf },
    Failure { folder_id: String, message: String },
}

pub struct WatchManager {
    guard: PathGuard,
    meta: Arc<MetaStore>,
    pipeline: Arc<Pipeline>,
    /// Live watcher handles; dropping one stops its watch.
    watchers: DashMap<String, RecommendedWatcher>,
    signals: mpsc::UnboundedSender<WatchSignal>,
    enabled: bool,
}

impl WatchManager {
    pub fn new(
        config: &Config,
        guard: PathGuard,
        meta: Arc<MetaStore>,
        pipeline: Arc<Pipeline>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            guard,
            meta: Arc::clone(&meta),
            pipeline: Arc::clone(&pipeline),
            watchers: DashMap::new(),
            signals: tx,
            enabled: config.watcher_enabled,
        });
        if config.watcher_enabled {
            let window = Duration::from_millis(config.watcher_debounce_ms.max(50));
            tokio::spawn(debounce_loop(rx, meta, pipeline, window));
        }
        manager
    }

    /// Register a watch for an active folder. Re-validates the path against
    /// the guard first; watcher registration failures transition the folder
    /// to the error state but leave explicit scans working.
    pub fn watch(&self, folder: &FolderRecord) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let root = PathBuf::from(&folder.path);
        if let Err(err) = self.guard.validate(&root) {
            self.mark_folder_error(&folder.folder_id, &err.to_string());
            tracing::warn!(folder = folder.folder_id.as_str(), error = %err, "Refusing to watch folder");
            return Err(err);
        }

        let signals = self.signals.clone();
        let folder_id = folder.folder_id.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = signals
                                .send(WatchSignal::Event { folder_id: folder_id.clone(), path });
                        }
                    }
                }
                Err(err) => {
                    let _ = signals.send(WatchSignal::Failure {
                        folder_id: folder_id.clone(),
                        message: err.to_string(),
                    });
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::ResourceExhausted(format!("create watcher: {e}")))?;

        watcher.watch(&root, RecursiveMode::Recursive).map_err(|e| {
            let err = Error::ResourceExhausted(format!("watch '{}': {e}", folder.path));
            self.mark_folder_error(&folder.folder_id, &err.to_string());
            err
        })?;

        self.watchers.insert(folder.folder_id.clone(), watcher);
        tracing::info!(folder = folder.folder_id.as_str(), path = folder.path.as_str(), "Watching folder");
        Ok(())
    }

    /// Drop a folder's watcher (pause, remove).
    pub fn unwatch(&self, folder_id: &str) {
        if self.watchers.remove(folder_id).is_some() {
            tracing::info!(folder = folder_id, "Stopped watching folder");
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watchers.len()
    }

    fn mark_folder_error(&self, folder_id: &str, message: &str) {
        self.meta.with_folder(folder_id, |folder| {
            folder.status = FolderState::Error;
            folder.last_error = Some(message.to_string());
        });
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

/// Coalesce bursts of events per path, then hand quiet paths to the
/// pipeline as jobs.
async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<WatchSignal>,
    meta: Arc<MetaStore>,
    pipeline: Arc<Pipeline>,
    window: Duration,
) {
    let mut pending: HashMap<(String, PathBuf), Instant> = HashMap::new();
    let mut tick = tokio::time::interval(window.min(Duration::from_millis(100)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(WatchSignal::Event { folder_id, path }) => {
                    pending.insert((folder_id, path), Instant::now());
                }
                Some(WatchSignal::Failure { folder_id, message }) => {
                    tracing::warn!(folder = folder_id.as_str(), error = message.as_str(), "Watcher error");
                    meta.with_folder(&folder_id, |folder| {
                        folder.status = FolderState::Error;
                        folder.last_error = Some(message.clone());
                    });
                }
                None => break,
            },
            _ = tick.tick() => {
                for (folder_id, path) in drain_ready(&mut pending, Instant::now(), window) {
                    dispatch_change(&meta, &pipeline, &folder_id, &path);
                }
            }
        }
    }
}

/// Remove and return entries that have been quiet for at least `window`.
fn drain_ready(
    pending: &mut HashMap<(String, PathBuf), Instant>,
    now: Instant,
    window: Duration,
) -> Vec<(String, PathBuf)> {
    let ready: Vec<(String, PathBuf)> = pending
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) >= window)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &ready {
        pending.remove(key);
    }
    ready
}

/// Turn one quiet path into a pipeline job.
fn dispatch_change(meta: &Arc<MetaStore>, pipeline: &Arc<Pipeline>, folder_id: &str, path: &Path) {
    let Some(folder) = meta.get_folder(folder_id) else { return };
    if folder.status != FolderState::Active {
        return;
    }
    let root = Path::new(&folder.path);
    if path == root {
        return;
    }
    let Ok(relative) = path.strip_prefix(root) else { return };
    if is_event_ignored(relative, &folder.ignores) {
        return;
    }

    let kind = if path.exists() {
        // Directory creation triggers a mini-scan of the subtree; files get
        // a single-file incremental job. Both carry the absolute target.
        JobKind::Incremental { target: path.to_path_buf() }
    } else {
        JobKind::DeleteFile { target: path.to_path_buf() }
    };
    let job = IndexJob::new(folder_id, kind);
    if let Err(err) = pipeline.submit(job) {
        // Dropped events are recovered by the next explicit or periodic scan.
        tracing::warn!(folder = folder_id, path = %path.display(), error = %err, "Dropped watch event");
    }
}

/// Events inside ignored or hidden directories never become jobs.
fn is_event_ignored(relative: &Path, extra_ignores: &[String]) -> bool {
    relative.components().any(|component| {
        let name = component.as_os_str().to_string_lossy();
        name.starts_with('.')
            || is_skipped_dir(name.as_ref())
            || extra_ignores.iter().any(|ignored| ignored == name.as_ref())
    })
}

// ---------------------------------------------------------------------------
// Periodic rescan timer
// ---------------------------------------------------------------------------

/// Enqueue a full scan for every active folder on a fixed interval. Runs
/// only when `periodicRescanSeconds` is non-zero.
pub fn spawn_periodic_rescan(config: &Config, meta: Arc<MetaStore>, pipeline: Arc<Pipeline>) {
    let seconds = config.periodic_rescan_seconds;
    if seconds == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(seconds));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup scans win.
        tick.tick().await;
        loop {
            tick.tick().await;
            for folder in meta.list_folders() {
                if folder.status != FolderState::Active {
                    continue;
                }
                let job = IndexJob::new(&folder.folder_id, JobKind::FullScan);
                if let Err(err) = pipeline.submit(job) {
                    tracing::debug!(folder = folder.folder_id.as_str(), error = %err, "Periodic rescan not queued");
                }
            }
        }
    });
}
