//! Runtime configuration. Loaded from a TOML file (camelCase keys) merged
//! over defaults; values without a safe default are startup errors.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration record, fixed at startup. Field names map 1:1
/// to the camelCase keys in `codevec.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    // Path Guard
    pub allowed_prefixes: Vec<String>,
    pub deny_prefixes: Vec<String>,
    pub min_path_depth: usize,

    // Chunker
    pub chunk_target_tokens: usize,
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub max_file_bytes: u64,

    // Embedding
    /// "http" for an external provider, "local" for the deterministic
    /// in-process embedder (hermetic runs, tests).
    pub embed_provider: String,
    pub embed_endpoint: String,
    /// Environment variable holding the provider API key. The key itself
    /// never appears in the config file.
    pub embed_api_key_env: String,
    pub embed_model: String,
    pub embed_batch_max: usize,
    pub embed_batch_bytes_max: usize,
    pub embed_concurrency: usize,
    pub embed_timeout_seconds: u64,
    pub embed_max_retries: u32,

    // Pipeline
    pub folder_concurrency: usize,
    pub file_concurrency: usize,
    pub job_queue_depth: usize,

    // Watcher
    pub watcher_enabled: bool,
    pub watcher_debounce_ms: u64,
    /// 0 disables the periodic rescan timer.
    pub periodic_rescan_seconds: u64,
    /// Soft cap on concurrently watched folders (OS watch descriptors).
    pub max_watched_folders: usize,

    // Vector store
    /// "qdrant" for the REST adapter, "memory" for the in-process store.
    pub vector_backend: String,
    pub vector_url: String,
    pub vector_collection: String,
    pub vector_dimension: usize,
    pub vector_metric: String,

    // Metadata store persistence. Empty = in-memory only.
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_prefixes: default_allowed_prefixes(),
            deny_prefixes: default_deny_prefixes(),
            min_path_depth: 2,
            chunk_target_tokens: 400,
            chunk_max_tokens: 600,
            chunk_overlap_tokens: 60,
            max_file_bytes: 2 * 1024 * 1024,
            embed_provider: "http".to_string(),
            embed_endpoint: String::new(),
            embed_api_key_env: "CODEVEC_EMBED_API_KEY".to_string(),
            embed_model: "voyage-code-3".to_string(),
            embed_batch_max: 64,
            embed_batch_bytes_max: 200 * 1024,
            embed_concurrency: 4,
            embed_timeout_seconds: 60,
            embed_max_retries: 5,
            folder_concurrency: 4,
            file_concurrency: 8,
            job_queue_depth: 32,
            watcher_enabled: true,
            watcher_debounce_ms: 500,
            periodic_rescan_seconds: 0,
            max_watched_folders: 32,
            vector_backend: "qdrant".to_string(),
            vector_url: "http://127.0.0.1:6333".to_string(),
            vector_collection: "codevec".to_string(),
            vector_dimension: 1024,
            vector_metric: "cosine".to_string(),
            data_dir: String::new(),
        }
    }
}

fn default_allowed_prefixes() -> Vec<String> {
    let mut prefixes = vec![
        "/home".to_string(),
        "/Users".to_string(),
        "/opt".to_string(),
        "/workspace".to_string(),
        "/app".to_string(),
    ];
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() && !prefixes.contains(&home) {
            prefixes.push(home);
        }
    }
    prefixes
}

fn default_deny_prefixes() -> Vec<String> {
    [
        "/bin", "/sbin", "/usr", "/lib", "/etc", "/var", "/proc", "/sys", "/dev", "/boot",
        "/System", "/Library", "/Windows", "/Program Files",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load from a TOML file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("config {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::InvalidArgument(format!("config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations with no safe interpretation. Called at startup;
    /// a failure here aborts the process before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.vector_metric != "cosine" {
            return Err(Error::InvalidArgument(format!(
                "vectorMetric must be \"cosine\", got \"{}\"",
                self.vector_metric
            )));
        }
        if self.vector_dimension == 0 {
            return Err(Error::InvalidArgument("vectorDimension must be > 0".to_string()));
        }
        match self.embed_provider.as_str() {
            "http" => {
                if self.embed_endpoint.is_empty() {
                    return Err(Error::InvalidArgument(
                        "embedEndpoint is required when embedProvider = \"http\"".to_string(),
                    ));
                }
            }
            "local" => {}
            other => {
                return Err(Error::InvalidArgument(format!(
                    "embedProvider must be \"http\" or \"local\", got \"{other}\""
                )));
            }
        }
        match self.vector_backend.as_str() {
            "qdrant" | "memory" => {}
            other => {
                return Err(Error::InvalidArgument(format!(
                    "vectorBackend must be \"qdrant\" or \"memory\", got \"{other}\""
                )));
            }
        }
        if self.chunk_max_tokens < self.chunk_target_tokens {
            return Err(Error::InvalidArgument(
                "chunkMaxTokens must be >= chunkTargetTokens".to_string(),
            ));
        }
        if self.chunk_overlap_tokens >= self.chunk_target_tokens {
            return Err(Error::InvalidArgument(
                "chunkOverlapTokens must be < chunkTargetTokens".to_string(),
            ));
        }
        if self.embed_batch_max == 0 || self.embed_concurrency == 0 {
            return Err(Error::InvalidArgument(
                "embedBatchMax and embedConcurrency must be > 0".to_string(),
            ));
        }
        if self.folder_concurrency == 0 || self.file_concurrency == 0 || self.job_queue_depth == 0
        {
            return Err(Error::InvalidArgument(
                "folderConcurrency, fileConcurrency and jobQueueDepth must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Metadata persistence directory, if configured.
    pub fn data_dir(&self) -> Option<PathBuf> {
        if self.data_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.data_dir))
        }
    }
}
