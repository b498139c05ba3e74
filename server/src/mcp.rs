//! MCP JSON-RPC dispatcher. Exposes the code-index tool family
//! (`code_index_add_folder`, `code_index_scan`, `code_index_search`, ...)
//! over a line-framed stdio transport and the HTTP transport in
//! [`crate::mcp_http`], which share [`dispatch_jsonrpc`].
//!
//! Tool arguments are deserialized into typed request records before any
//! business code runs; malformed input is rejected with `invalid_argument`.
//! Tool results are placed directly in the JSON-RPC `result`, and errors
//! carry the taxonomy string in `error.code`.

use crate::embed::with_retries;
use crate::error::{Error, Result};
use crate::meta::FolderState;
use crate::pipeline::{IndexJob, JobKind};
use crate::vector::SearchFilter;
use crate::AppState;
use serde::Deserialize;
use std::io::Write as IoWrite;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Hard ceiling on search result count, regardless of the request.
const MAX_TOP_K: usize = 50;
const DEFAULT_TOP_K: usize = 10;
const SNIPPET_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Typed tool arguments
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AddFolderArgs {
    folder_path: String,
    #[serde(default)]
    ignores: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FolderRefArgs {
    folder_id: Option<String>,
    folder_path: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StatusArgs {
    folder_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchArgs {
    query: String,
    top_k: Option<usize>,
    folder_id: Option<String>,
    language: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FolderIdArgs {
    folder_id: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: &serde_json::Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::InvalidArgument(format!("{tool}: {e}")))
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

pub fn tool_definitions() -> serde_json::Value {
    let ro = serde_json::json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });
    let mutating = serde_json::json!({
        "readOnlyHint": false,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });
    let destructive = serde_json::json!({
        "readOnlyHint": false,
        "destructiveHint": true,
        "idempotentHint": true,
        "openWorldHint": false
    });

    serde_json::json!([
        {
            "name": "code_index_add_folder",
            "annotations": mutating,
            "description": "Register a folder for semantic indexing and start its first scan. The path must be absolute and pass the server's path safety rules.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderPath": { "type": "string", "description": "Absolute path of the folder to index" },
                    "ignores": { "type": "array", "items": { "type": "string" }, "description": "Extra directory or file names to skip for this folder" }
                },
                "required": ["folderPath"]
            }
        },
        {
            "name": "code_index_remove_folder",
            "annotations": destructive,
            "description": "Unregister a folder and delete all of its indexed files, chunks, and vectors. In-flight indexing work is cancelled.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderId": { "type": "string", "description": "Folder id returned by code_index_add_folder" },
                    "folderPath": { "type": "string", "description": "Registered folder path (alternative to folderId)" }
                }
            }
        },
        {
            "name": "code_index_list_folders",
            "annotations": ro,
            "description": "List registered folders with their status and counts.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        },
        {
            "name": "code_index_scan",
            "annotations": mutating,
            "description": "Queue a full scan of a folder. Returns immediately with a job id; poll progress with code_index_status. filesQueued is the folder's last known file count.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderId": { "type": "string", "description": "Folder id" },
                    "folderPath": { "type": "string", "description": "Registered folder path (alternative to folderId)" }
                }
            }
        },
        {
            "name": "code_index_status",
            "annotations": ro,
            "description": "Report per-folder indexing progress, queue depth, and error counts. Omit folderId for all folders.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderId": { "type": "string", "description": "Restrict to one folder" }
                }
            }
        },
        {
            "name": "code_index_search",
            "annotations": ro,
            "description": "Semantic search over indexed code. Returns chunks ranked by cosine similarity with file, line span, and snippet.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language or code query" },
                    "topK": { "type": "integer", "description": "Max results (default 10, cap 50)" },
                    "folderId": { "type": "string", "description": "Restrict to one folder" },
                    "language": { "type": "string", "description": "Restrict to one language (e.g. 'rust', 'python')" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "code_index_pause",
            "annotations": mutating,
            "description": "Pause a folder: stop its watcher and refuse new jobs. Indexed data stays searchable.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderId": { "type": "string", "description": "Folder id" }
                },
                "required": ["folderId"]
            }
        },
        {
            "name": "code_index_resume",
            "annotations": mutating,
            "description": "Resume a paused folder: restart its watcher and queue a catch-up scan.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folderId": { "type": "string", "description": "Folder id" }
                },
                "required": ["folderId"]
            }
        }
    ])
}

// ---------------------------------------------------------------------------
// Tool handlers
// ---------------------------------------------------------------------------

/// Execute one tool call. Tools that mutate the registry are serialized
/// through a single lock; query tools run without it.
pub async fn handle_tool(
    state: &Arc<AppState>,
    name: &str,
    args: &serde_json::Value,
) -> Result<serde_json::Value> {
    match name {
        "code_index_add_folder" => {
            let parsed: AddFolderArgs = parse_args(name, args)?;
            let _lock = state.mutate_lock.lock().await;
            let folder = state.registry.add(Path::new(&parsed.folder_path), parsed.ignores)?;
            // Watch registration re-validates the guard; a failure flips the
            // folder to the error state but keeps it registered.
            let _ = state.watcher.watch(&folder);
            let job = IndexJob::new(&folder.folder_id, JobKind::FullScan);
            if let Err(err) = state.pipeline.submit(job) {
                tracing::warn!(folder = folder.folder_id.as_str(), error = %err, "Initial scan not queued");
            }
            let current = state.registry.get(&folder.folder_id)?;
            Ok(serde_json::json!({
                "folderId": current.folder_id,
                "status": status_str(current.status),
            }))
        }

        "code_index_remove_folder" => {
            let parsed: FolderRefArgs = parse_args(name, args)?;
            let _lock = state.mutate_lock.lock().await;
            let folder = state
                .registry
                .resolve(parsed.folder_id.as_deref(), parsed.folder_path.as_deref())?;
            state.pipeline.cancel_folder(&folder.folder_id);
            state.watcher.unwatch(&folder.folder_id);
            // The registry cascades the metadata delete; vector cleanup
            // follows so a failure leaves orphan vectors, never orphan rows.
            let (files, _chunks) = state.registry.remove(&folder.folder_id)?;
            state.pipeline.purge_folder_vectors(&folder.folder_id).await;
            Ok(serde_json::json!({ "removed": files }))
        }

        "code_index_list_folders" => {
            let folders = state.registry.list();
            Ok(serde_json::json!({ "folders": folders }))
        }

        "code_index_scan" => {
            let parsed: FolderRefArgs = parse_args(name, args)?;
            let folder = state
                .registry
                .resolve(parsed.folder_id.as_deref(), parsed.folder_path.as_deref())?;
            // An error-state folder may scan only if its path still passes
            // the guard; a persisted-but-forbidden path must never index.
            if folder.status == FolderState::Error {
                state.registry.guard().validate(Path::new(&folder.path))?;
            }
            let job = IndexJob::new(&folder.folder_id, JobKind::FullScan);
            let job_id = state.pipeline.submit(job)?;
            Ok(serde_json::json!({
                "jobId": job_id,
                "filesQueued": folder.file_count,
            }))
        }

        "code_index_status" => {
            let parsed: StatusArgs = parse_args(name, args)?;
            let folders = match &parsed.folder_id {
                Some(folder_id) => vec![state.registry.get(folder_id)?],
                None => state.registry.list(),
            };
            let snapshots: Vec<serde_json::Value> = folders
                .iter()
                .map(|folder| {
                    let mut snapshot =
                        serde_json::to_value(state.status.snapshot(&folder.folder_id))
                            .unwrap_or_default();
                    snapshot["path"] = serde_json::json!(folder.path);
                    snapshot["status"] = serde_json::json!(status_str(folder.status));
                    snapshot["fileCount"] = serde_json::json!(folder.file_count);
                    snapshot["chunkCount"] = serde_json::json!(folder.chunk_count);
                    if let Some(last_scan) = folder.last_scan_at {
                        snapshot["lastScanAt"] = serde_json::json!(last_scan);
                    }
                    if let Some(error) = &folder.last_error {
                        snapshot["lastError"] = serde_json::json!(error);
                    }
                    snapshot
                })
                .collect();
            Ok(serde_json::json!({ "folders": snapshots }))
        }

        "code_index_search" => {
            let parsed: SearchArgs = parse_args(name, args)?;
            if parsed.query.trim().is_empty() {
                return Err(Error::InvalidArgument("query must not be empty".to_string()));
            }
            let top_k = parsed.top_k.unwrap_or(DEFAULT_TOP_K).clamp(1, MAX_TOP_K);
            if let Some(folder_id) = &parsed.folder_id {
                state.registry.get(folder_id)?;
            }

            let cancel = CancellationToken::new();
            let embedder = Arc::clone(&state.embedder);
            let query = parsed.query.clone();
            let vectors = with_retries(state.config.embed_max_retries, &cancel, || {
                let embedder = Arc::clone(&embedder);
                let query = vec![query.clone()];
                async move { embedder.embed(&query).await }
            })
            .await?;
            let query_vector = vectors
                .into_iter()
                .next()
                .ok_or_else(|| Error::Internal("provider returned no query vector".to_string()))?;

            let filter = SearchFilter {
                folder_id: parsed.folder_id.clone(),
                language: parsed.language.clone(),
            };
            let store = Arc::clone(&state.vectors);
            let hits = with_retries(state.config.embed_max_retries, &cancel, || {
                let store = Arc::clone(&store);
                let query_vector = query_vector.clone();
                let filter = filter.clone();
                async move { store.query(&query_vector, top_k, &filter).await }
            })
            .await?;

            let results: Vec<serde_json::Value> = hits
                .iter()
                .filter_map(|hit| {
                    // A vector whose chunk row is gone is an orphan from a
                    // crash or pending delete; never surface it.
                    let chunk = state.meta.get_chunk(&hit.id)?;
                    Some(serde_json::json!({
                        "relativePath": hit.payload.relative_path,
                        "startLine": hit.payload.start_line,
                        "endLine": hit.payload.end_line,
                        "score": hit.score,
                        "snippet": snippet(&chunk.content),
                        "folderId": hit.payload.folder_id,
                        "fileId": hit.payload.file_id,
                        "chunkIndex": hit.payload.chunk_index,
                        "language": hit.payload.language,
                    }))
                })
                .collect();
            Ok(serde_json::json!({ "results": results }))
        }

        "code_index_pause" => {
            let parsed: FolderIdArgs = parse_args(name, args)?;
            let _lock = state.mutate_lock.lock().await;
            let folder = state.registry.pause(&parsed.folder_id)?;
            state.watcher.unwatch(&folder.folder_id);
            Ok(serde_json::json!({ "status": status_str(folder.status) }))
        }

        "code_index_resume" => {
            let parsed: FolderIdArgs = parse_args(name, args)?;
            let _lock = state.mutate_lock.lock().await;
            let folder = state.registry.resume(&parsed.folder_id)?;
            let _ = state.watcher.watch(&folder);
            // Catch up on whatever changed while paused.
            let job = IndexJob::new(&folder.folder_id, JobKind::FullScan);
            if let Err(err) = state.pipeline.submit(job) {
                tracing::warn!(folder = folder.folder_id.as_str(), error = %err, "Catch-up scan not queued");
            }
            let current = state.registry.get(&folder.folder_id)?;
            Ok(serde_json::json!({ "status": status_str(current.status) }))
        }

        _ => Err(Error::InvalidArgument(format!("unknown tool '{name}'"))),
    }
}

fn status_str(state: FolderState) -> &'static str {
    match state {
        FolderState::Active => "active",
        FolderState::Paused => "paused",
        FolderState::Error => "error",
    }
}

/// Snippet for search results: the chunk's first 200 characters.
fn snippet(content: &str) -> String {
    if content.len() <= SNIPPET_CHARS {
        return content.to_string();
    }
    let mut end = SNIPPET_CHARS;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

// ---------------------------------------------------------------------------
// Protocol version negotiation
// ---------------------------------------------------------------------------

pub(crate) const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26"];
pub(crate) const LATEST_VERSION: &str = "2025-06-18";

/// Echo the client's version when supported, otherwise answer with ours.
pub(crate) fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS.iter().find(|&&v| v == client_version).copied().unwrap_or(LATEST_VERSION)
}

// ---------------------------------------------------------------------------
// Shared JSON-RPC dispatch (stdio and HTTP transports)
// ---------------------------------------------------------------------------

/// Process a single JSON-RPC request. Returns `None` for notifications.
pub async fn dispatch_jsonrpc(
    state: &Arc<AppState>,
    msg: &serde_json::Value,
) -> Option<serde_json::Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => {
            let client_version = msg["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": negotiated,
                    "capabilities": {
                        "tools": { "listChanged": false }
                    },
                    "serverInfo": {
                        "name": "codevec",
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "instructions": "codevec — semantic code search over registered folders. Register with code_index_add_folder, poll code_index_status until progress reaches 1.0, then retrieve grounded code with code_index_search."
                }
            })
        }
        "tools/list" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tool_definitions() }
            })
        }
        "tools/call" => {
            let tool_name = msg["params"]["name"].as_str().unwrap_or("");
            let arguments =
                msg["params"].get("arguments").cloned().unwrap_or(serde_json::json!({}));
            // Correlation id for tracing the call through internal stages.
            let corr_id = Uuid::new_v4().to_string();
            tracing::info!(corr_id = corr_id.as_str(), tool = tool_name, "Tool call");
            let started = std::time::Instant::now();

            match handle_tool(state, tool_name, &arguments).await {
                Ok(result) => {
                    tracing::info!(
                        corr_id = corr_id.as_str(),
                        tool = tool_name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Tool call ok"
                    );
                    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
                }
                Err(err) => {
                    let level_warn = matches!(err, Error::PathRejected(_));
                    if level_warn {
                        tracing::warn!(corr_id = corr_id.as_str(), tool = tool_name, error = %err, "Tool call rejected");
                    } else {
                        tracing::info!(corr_id = corr_id.as_str(), tool = tool_name, error = %err, "Tool call failed");
                    }
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": err.kind(),
                            "message": err.to_string(),
                            "data": { "tool": tool_name, "corrId": corr_id }
                        }
                    })
                }
            }
        }
        "ping" => {
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        }
        _ => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": "invalid_argument",
                    "message": format!("unknown method '{method}'")
                }
            })
        }
    };

    Some(response)
}

// ---------------------------------------------------------------------------
// MCP stdio server loop
// ---------------------------------------------------------------------------

/// Read line-framed JSON-RPC from stdin, write responses to stdout. Used
/// when the server runs as an MCP subprocess of an agent.
pub async fn run_stdio(state: Arc<AppState>) {
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();
    let mut initialized = false;

    tracing::info!(folders = state.registry.list().len(), "MCP stdio server ready");

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => {
                write_line(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": "invalid_argument", "message": "parse error" }
                }));
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");
        if method.starts_with("notifications/") {
            continue;
        }

        // Init ordering: reject anything but initialize/ping until initialized.
        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                write_line(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": "invalid_argument",
                        "message": "server not initialized; send 'initialize' first"
                    }
                }));
            }
            continue;
        }

        if let Some(response) = dispatch_jsonrpc(&state, &msg).await {
            if method == "initialize" {
                initialized = true;
            }
            write_line(&response);
        }
    }
}

fn write_line(value: &serde_json::Value) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}
