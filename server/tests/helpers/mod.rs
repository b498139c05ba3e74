//! Test harness for MCP tool integration tests.
//!
//! Builds an `AppState` over a temp directory with the deterministic local
//! embedder and the in-memory vector store, then dispatches JSON-RPC
//! requests via `dispatch_jsonrpc()` directly (no subprocess, no HTTP).

use codevec_server::config::Config;
use codevec_server::mcp::dispatch_jsonrpc;
use codevec_server::meta::now_millis;
use codevec_server::{build_state, AppState};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub root: PathBuf,
    _temp_dir: TempDir,
}

impl TestHarness {
    /// Hermetic harness: the temp dir is the only allowed prefix, chunk
    /// budgets are small so short fixtures produce several chunks, and the
    /// watcher is off (indexing runs via explicit scan tools).
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = std::fs::canonicalize(temp_dir.path()).expect("canonical temp root");
        let config = Config {
            allowed_prefixes: vec![root.display().to_string()],
            embed_provider: "local".to_string(),
            vector_backend: "memory".to_string(),
            vector_dimension: 256,
            watcher_enabled: false,
            chunk_target_tokens: 32,
            chunk_max_tokens: 48,
            chunk_overlap_tokens: 8,
            job_queue_depth: 4,
            ..Config::default()
        };
        let state = build_state(config).await.expect("state builds");
        Self { state, root, _temp_dir: temp_dir }
    }

    /// Create a project dir under the allowed root.
    pub fn project(&self, name: &str) -> PathBuf {
        let dir = self.root.join("projects").join(name);
        std::fs::create_dir_all(&dir).expect("project dir");
        dir
    }

    pub fn write_file(&self, dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).expect("parent dir");
        std::fs::write(path, content).expect("write fixture");
    }

    // -- JSON-RPC plumbing ---------------------------------------------------

    pub async fn rpc(&self, method: &str, params: Value) -> Value {
        let msg = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        dispatch_jsonrpc(&self.state, &msg).await.expect("response for request")
    }

    pub async fn initialize(&self) -> Value {
        self.rpc("initialize", json!({ "protocolVersion": "2025-06-18" })).await
    }

    /// Call a tool, returning the full JSON-RPC response.
    pub async fn call_tool(&self, name: &str, args: Value) -> Value {
        self.rpc("tools/call", json!({ "name": name, "arguments": args })).await
    }

    /// Call a tool and unwrap its `result`; panics on error responses.
    pub async fn call_ok(&self, name: &str, args: Value) -> Value {
        let response = self.call_tool(name, args).await;
        assert!(
            response.get("error").is_none(),
            "tool {name} failed: {}",
            response["error"]
        );
        response["result"].clone()
    }

    /// Call a tool expecting an error; returns `(code, message)`.
    pub async fn call_err(&self, name: &str, args: Value) -> (String, String) {
        let response = self.call_tool(name, args).await;
        let error = response.get("error").unwrap_or_else(|| {
            panic!("tool {name} unexpectedly succeeded: {}", response["result"])
        });
        (
            error["code"].as_str().unwrap_or_default().to_string(),
            error["message"].as_str().unwrap_or_default().to_string(),
        )
    }

    // -- indexing helpers ----------------------------------------------------

    /// Register a folder (which queues its first scan) and wait for the
    /// index to settle.
    pub async fn add_and_index(&self, dir: &Path) -> String {
        let before = now_millis();
        let result = self
            .call_ok(
                "code_index_add_folder",
                json!({ "folderPath": dir.display().to_string() }),
            )
            .await;
        let folder_id = result["folderId"].as_str().expect("folderId").to_string();
        self.wait_for_scan(&folder_id, before).await;
        folder_id
    }

    /// Queue a scan and wait for it to complete.
    pub async fn scan_and_wait(&self, folder_id: &str) -> Value {
        let before = now_millis();
        let result =
            self.call_ok("code_index_scan", json!({ "folderId": folder_id })).await;
        assert!(result["jobId"].is_string(), "scan returns a jobId: {result}");
        self.wait_for_scan(folder_id, before).await;
        result
    }

    /// Poll `code_index_status` until a scan completed at or after `since`
    /// and the queue is drained.
    pub async fn wait_for_scan(&self, folder_id: &str, since: u64) {
        for _ in 0..200 {
            let status = self.folder_status(folder_id).await;
            let scanned = status["lastScanAt"].as_u64().map(|t| t >= since).unwrap_or(false);
            let idle = status["phase"] == "idle" && status["queueDepth"] == 0;
            if scanned && idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("folder {folder_id} did not finish indexing in time");
    }

    /// The status entry for one folder.
    pub async fn folder_status(&self, folder_id: &str) -> Value {
        let result =
            self.call_ok("code_index_status", json!({ "folderId": folder_id })).await;
        result["folders"][0].clone()
    }
}

/// A 60-line python fixture with `def compute_priority(task):` at line 40.
pub fn priority_py() -> String {
    let mut out = String::from("# task utilities\nimport math\n\n");
    for i in 3..39 {
        out.push_str(&format!("DEFAULT_WEIGHT_{i} = {i}\n"));
    }
    // Lines 40..52: the function the search scenario looks for.
    out.push_str("def compute_priority(task):\n");
    out.push_str("    \"\"\"Compute the priority score for a task.\"\"\"\n");
    out.push_str("    score = task.urgency * 2\n");
    out.push_str("    if task.blocked:\n");
    out.push_str("        score -= 5\n");
    out.push_str("    if task.due_soon:\n");
    out.push_str("        score += 3\n");
    out.push_str("    age_bonus = math.log(task.age_days + 1)\n");
    out.push_str("    score += age_bonus\n");
    out.push_str("    if score < 0:\n");
    out.push_str("        score = 0\n");
    out.push_str("    return score\n");
    out.push('\n');
    for i in 53..=60 {
        out.push_str(&format!("FALLBACK_LIMIT_{i} = {i}\n"));
    }
    out
}

/// A 120-line go fixture.
pub fn server_go() -> String {
    let mut out = String::from("package server\n\n");
    for i in 0..29 {
        out.push_str(&format!(
            "func HandleRoute{i}(w ResponseWriter) {{\n\trender(w, {i})\n}}\n\n"
        ));
    }
    out
}
