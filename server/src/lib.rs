//! codevec server library — semantic code indexing and retrieval over MCP.
//!
//! The crate wires a scanner, chunker, embedding pipeline, and vector store
//! behind the `code_index_*` tool family. [`build_state`] assembles the
//! components; [`mcp::run_stdio`] and the axum routes in [`mcp_http`] are
//! the two transports.

pub mod chunk;
pub mod config;
pub mod diff;
pub mod embed;
pub mod error;
pub mod guard;
pub mod hash;
pub mod mcp;
pub mod mcp_http;
pub mod meta;
pub mod pipeline;
pub mod registry;
pub mod scan;
pub mod status;
pub mod vector;
pub mod watch;

use crate::config::Config;
use crate::embed::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::guard::PathGuard;
use crate::meta::{FolderState, MetaStore};
use crate::pipeline::{IndexJob, JobKind, Pipeline};
use crate::registry::FolderRegistry;
use crate::status::StatusAggregator;
use crate::vector::VectorStore;
use crate::watch::WatchManager;
use std::sync::Arc;

/// Shared state behind every transport and tool handler.
pub struct AppState {
    pub config: Config,
    pub meta: Arc<MetaStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub registry: Arc<FolderRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub status: Arc<StatusAggregator>,
    pub watcher: Arc<WatchManager>,
    /// Serializes registry-mutating tool calls.
    pub mutate_lock: tokio::sync::Mutex<()>,
}

/// Build and cross-check all components. Fails fast on configuration
/// errors and on embedding/vector dimension mismatches.
pub async fn build_state(config: Config) -> Result<Arc<AppState>> {
    config.validate()?;

    let meta = Arc::new(MetaStore::open(config.data_dir())?);
    let embedder = embed::build_provider(&config)?;
    let vectors = vector::build_store(&config)?;

    if embedder.dimension() != config.vector_dimension {
        return Err(Error::InvalidArgument(format!(
            "embedding dimension {} does not match vectorDimension {}",
            embedder.dimension(),
            config.vector_dimension
        )));
    }
    vectors.ensure_collection().await?;

    let guard = PathGuard::new(&config);
    let registry = Arc::new(FolderRegistry::new(
        Arc::clone(&meta),
        guard.clone(),
        config.max_watched_folders,
    ));
    let status = Arc::new(StatusAggregator::new());
    let pipeline = Pipeline::new(
        config.clone(),
        Arc::clone(&meta),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        Arc::clone(&status),
    );
    let watcher = WatchManager::new(&config, guard, Arc::clone(&meta), Arc::clone(&pipeline));

    Ok(Arc::new(AppState {
        config,
        meta,
        vectors,
        embedder,
        registry,
        pipeline,
        status,
        watcher,
        mutate_lock: tokio::sync::Mutex::new(()),
    }))
}

/// Startup pass over persisted folders: re-validate against the Path Guard,
/// re-register watches for active folders, and queue a reconciling scan.
pub fn start_folders(state: &Arc<AppState>) {
    state.registry.revalidate_persisted();
    for folder in state.registry.list() {
        if folder.status != FolderState::Active {
            continue;
        }
        if state.watcher.watch(&folder).is_err() {
            // The folder is now in the error state; explicit scans may still
            // be refused by the guard, so don't queue one.
            continue;
        }
        let job = IndexJob::new(&folder.folder_id, JobKind::FullScan);
        if let Err(err) = state.pipeline.submit(job) {
            tracing::warn!(folder = folder.folder_id.as_str(), error = %err, "Startup scan not queued");
        }
    }
}
