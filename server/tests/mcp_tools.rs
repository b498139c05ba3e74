//! Integration tests for the code_index tool family via dispatch_jsonrpc().
//!
//! Each test builds an AppState over a temp dir (local embedder, in-memory
//! vector store), registers fixture folders, and drives the tools end to
//! end through JSON-RPC.

mod helpers;

use helpers::{priority_py, server_go, TestHarness};
use serde_json::json;

// ---------------------------------------------------------------------------
// Protocol tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_reports_server_info() {
    let h = TestHarness::new().await;
    let resp = h.initialize().await;
    assert_eq!(resp["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(resp["result"]["serverInfo"]["name"], "codevec");
    assert!(resp["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn tools_list_exposes_the_code_index_family() {
    let h = TestHarness::new().await;
    let resp = h.rpc("tools/list", json!({})).await;
    let tools = resp["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    for expected in [
        "code_index_add_folder",
        "code_index_remove_folder",
        "code_index_list_folders",
        "code_index_scan",
        "code_index_status",
        "code_index_search",
        "code_index_pause",
        "code_index_resume",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
}

#[tokio::test]
async fn unknown_method_and_tool_return_structured_errors() {
    let h = TestHarness::new().await;
    let resp = h.rpc("no/such/method", json!({})).await;
    assert_eq!(resp["error"]["code"], "invalid_argument");

    let (code, message) = h.call_err("code_index_frobnicate", json!({})).await;
    assert_eq!(code, "invalid_argument");
    assert!(message.contains("code_index_frobnicate"), "{message}");
}

#[tokio::test]
async fn malformed_arguments_are_rejected_before_business_code() {
    let h = TestHarness::new().await;
    let (code, _) = h.call_err("code_index_add_folder", json!({})).await;
    assert_eq!(code, "invalid_argument");

    let (code, _) = h
        .call_err("code_index_add_folder", json!({ "folderPath": "/x", "unexpected": 1 }))
        .await;
    assert_eq!(code, "invalid_argument");

    let (code, _) = h.call_err("code_index_search", json!({ "query": "   " })).await;
    assert_eq!(code, "invalid_argument");
}

// ---------------------------------------------------------------------------
// Path guard and registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn adding_the_filesystem_root_is_rejected() {
    let h = TestHarness::new().await;
    let (code, message) = h.call_err("code_index_add_folder", json!({ "folderPath": "/" })).await;
    assert_eq!(code, "path_rejected");
    assert!(message.contains("root filesystem"), "{message}");
    // No record was created.
    let folders = h.call_ok("code_index_list_folders", json!({})).await;
    assert_eq!(folders["folders"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn nested_folder_registration_conflicts() {
    let h = TestHarness::new().await;
    let parent = h.project("proj");
    h.write_file(&parent, "a.py", b"x = 1\n");
    let sub = parent.join("sub");
    std::fs::create_dir_all(&sub).unwrap();

    h.add_and_index(&parent).await;
    let (code, _) = h
        .call_err("code_index_add_folder", json!({ "folderPath": sub.display().to_string() }))
        .await;
    assert_eq!(code, "conflict");
}

#[tokio::test]
async fn add_then_list_then_remove_round_trips() {
    let h = TestHarness::new().await;
    let dir = h.project("roundtrip");
    h.write_file(&dir, "lib.rs", b"pub fn one() -> usize { 1 }\n");
    let folder_id = h.add_and_index(&dir).await;

    let folders = h.call_ok("code_index_list_folders", json!({})).await;
    let listed = folders["folders"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["folderId"].as_str().unwrap(), folder_id);

    let removed = h.call_ok("code_index_remove_folder", json!({ "folderId": folder_id })).await;
    assert_eq!(removed["removed"], 1);

    let folders = h.call_ok("code_index_list_folders", json!({})).await;
    assert_eq!(folders["folders"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_folder_is_not_found() {
    let h = TestHarness::new().await;
    let (code, _) = h.call_err("code_index_scan", json!({ "folderId": "missing" })).await;
    assert_eq!(code, "not_found");
    let (code, _) = h.call_err("code_index_status", json!({ "folderId": "missing" })).await;
    assert_eq!(code, "not_found");
    let (code, _) =
        h.call_err("code_index_remove_folder", json!({ "folderPath": "/nowhere/at/all" })).await;
    assert_eq!(code, "not_found");
}

// ---------------------------------------------------------------------------
// Scanning and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_scan_indexes_text_and_skips_binary() {
    let h = TestHarness::new().await;
    let dir = h.project("three");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    h.write_file(&dir, "b.go", server_go().as_bytes());
    h.write_file(&dir, "c.bin", b"CAFE\x00BABE binary payload");
    let folder_id = h.add_and_index(&dir).await;

    let status = h.folder_status(&folder_id).await;
    assert_eq!(status["filesIndexed"], 2, "status: {status}");
    assert_eq!(status["filesSkipped"], 1, "status: {status}");
    assert_eq!(status["filesFailed"], 0, "status: {status}");
    assert_eq!(status["errors"], 0, "status: {status}");
    assert!(status["chunksIndexed"].as_u64().unwrap() >= 2, "status: {status}");
    assert_eq!(status["progress"], 1.0, "status: {status}");
    assert_eq!(status["queueDepth"], 0, "status: {status}");
}

#[tokio::test]
async fn rescan_of_unchanged_folder_embeds_nothing() {
    let h = TestHarness::new().await;
    let dir = h.project("steady");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    h.write_file(&dir, "b.go", server_go().as_bytes());
    let folder_id = h.add_and_index(&dir).await;

    let calls_before = h.state.embedder.calls();
    let vectors_before = h.state.vectors.count(Some(&folder_id)).await.unwrap();

    h.scan_and_wait(&folder_id).await;

    assert_eq!(h.state.embedder.calls(), calls_before, "idempotent rescan embedded something");
    assert_eq!(h.state.vectors.count(Some(&folder_id)).await.unwrap(), vectors_before);
}

#[tokio::test]
async fn editing_a_file_reindexes_and_purges_stale_chunks() {
    let h = TestHarness::new().await;
    let dir = h.project("edits");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    let folder_id = h.add_and_index(&dir).await;

    // Shrink the file to a fraction of its original size; stale chunks must
    // disappear from both stores.
    h.write_file(&dir, "a.py", b"def compute_priority(task):\n    return 1\n");
    h.scan_and_wait(&folder_id).await;

    let record = h.state.meta.file_by_path(&folder_id, "a.py").expect("file record");
    let chunk_ids = h.state.meta.chunk_ids_by_file(&record.file_id);
    assert_eq!(chunk_ids.len() as u64, record.chunk_count);
    assert_eq!(chunk_ids.len(), 1, "shrunken file should be a single chunk");

    // Vector store holds exactly the chunks the metadata claims.
    let vector_count = h.state.vectors.count(Some(&folder_id)).await.unwrap();
    assert_eq!(vector_count, chunk_ids.len());
}

#[tokio::test]
async fn deleting_a_file_removes_it_from_both_stores() {
    let h = TestHarness::new().await;
    let dir = h.project("deletions");
    h.write_file(&dir, "keep.py", b"def keep():\n    return 1\n");
    h.write_file(&dir, "drop.py", b"def drop():\n    return 2\n");
    let folder_id = h.add_and_index(&dir).await;

    std::fs::remove_file(dir.join("drop.py")).unwrap();
    h.scan_and_wait(&folder_id).await;

    assert!(h.state.meta.file_by_path(&folder_id, "drop.py").is_none());
    assert!(h.state.meta.file_by_path(&folder_id, "keep.py").is_some());
    let files: Vec<String> = h
        .state
        .meta
        .files_by_folder(&folder_id)
        .into_iter()
        .map(|f| f.relative_path)
        .collect();
    assert_eq!(files, vec!["keep.py".to_string()]);
}

#[tokio::test]
async fn oversized_files_are_skipped_as_large() {
    let h = TestHarness::new().await;
    let dir = h.project("huge");
    h.write_file(&dir, "ok.py", b"x = 1\n");
    let huge = "y = 2\n".repeat(400_000); // ~2.3 MiB > maxFileBytes
    h.write_file(&dir, "huge.py", huge.as_bytes());
    let folder_id = h.add_and_index(&dir).await;

    let status = h.folder_status(&folder_id).await;
    assert_eq!(status["filesIndexed"], 1, "status: {status}");
    assert_eq!(status["filesSkipped"], 1, "status: {status}");
    let record = h.state.meta.file_by_path(&folder_id, "huge.py").expect("skip recorded");
    assert_eq!(record.last_error.as_deref(), Some("skipped_large"));
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_finds_the_priority_function_in_top_results() {
    let h = TestHarness::new().await;
    let dir = h.project("searchable");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    h.write_file(&dir, "b.go", server_go().as_bytes());
    h.add_and_index(&dir).await;

    let result = h
        .call_ok(
            "code_index_search",
            json!({ "query": "function that computes task priority", "topK": 5 }),
        )
        .await;
    let results = result["results"].as_array().unwrap();
    assert!(!results.is_empty(), "no search results");

    let top3 = &results[..results.len().min(3)];
    let hit = top3
        .iter()
        .find(|r| {
            r["relativePath"] == "a.py"
                && r["startLine"].as_u64().unwrap() <= 40
                && r["endLine"].as_u64().unwrap() >= 40
        })
        .unwrap_or_else(|| panic!("compute_priority chunk not in top-3: {results:?}"));
    assert!(hit["snippet"].as_str().unwrap().contains("compute_priority"));
}

#[tokio::test]
async fn search_results_honor_the_payload_contract() {
    let h = TestHarness::new().await;
    let dir = h.project("payloads");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    let folder_id = h.add_and_index(&dir).await;

    let result = h
        .call_ok("code_index_search", json!({ "query": "priority score", "topK": 50 }))
        .await;
    let results = result["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for hit in results {
        assert_eq!(hit["folderId"].as_str().unwrap(), folder_id);
        assert!(hit["fileId"].is_string());
        assert_eq!(hit["relativePath"], "a.py");
        assert!(hit["chunkIndex"].is_u64());
        let start = hit["startLine"].as_u64().unwrap();
        let end = hit["endLine"].as_u64().unwrap();
        assert!(start >= 1 && start <= end);
        let score = hit["score"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&score), "score out of range: {score}");
        assert!(hit["snippet"].is_string());
    }
}

#[tokio::test]
async fn search_filters_by_folder_and_language() {
    let h = TestHarness::new().await;
    let py_dir = h.project("pyproj");
    h.write_file(&py_dir, "a.py", priority_py().as_bytes());
    let go_dir = h.project("goproj");
    h.write_file(&go_dir, "b.go", server_go().as_bytes());
    let py_folder = h.add_and_index(&py_dir).await;
    h.add_and_index(&go_dir).await;

    let result = h
        .call_ok(
            "code_index_search",
            json!({ "query": "priority task score", "folderId": py_folder }),
        )
        .await;
    for hit in result["results"].as_array().unwrap() {
        assert_eq!(hit["folderId"].as_str().unwrap(), py_folder);
    }

    let result = h
        .call_ok("code_index_search", json!({ "query": "handle route render", "language": "go" }))
        .await;
    let results = result["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for hit in results {
        assert_eq!(hit["language"], "go");
    }
}

#[tokio::test]
async fn orphan_vectors_never_surface_in_search() {
    use codevec_server::vector::{PointPayload, VectorPoint};

    let h = TestHarness::new().await;
    let dir = h.project("orphans");
    h.write_file(&dir, "a.py", b"def real():\n    return 1\n");
    let folder_id = h.add_and_index(&dir).await;

    // Simulate a crash between vector upsert and metadata write: a vector
    // point with no chunk row.
    let orphan = VectorPoint {
        id: "00000000-0000-0000-0000-00000000dead".to_string(),
        vector: vec![1.0; 256],
        payload: PointPayload {
            folder_id: folder_id.clone(),
            file_id: "ghost".to_string(),
            relative_path: "ghost.py".to_string(),
            chunk_index: 0,
            start_line: 1,
            end_line: 1,
            language: None,
            content_hash: "ghost".to_string(),
        },
    };
    h.state.vectors.upsert(vec![orphan]).await.unwrap();

    let result =
        h.call_ok("code_index_search", json!({ "query": "real function", "topK": 50 })).await;
    for hit in result["results"].as_array().unwrap() {
        assert_ne!(hit["relativePath"], "ghost.py");
    }
}

// ---------------------------------------------------------------------------
// Cascade delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_folder_cascades_to_files_chunks_and_vectors() {
    let h = TestHarness::new().await;
    let dir = h.project("cascade");
    h.write_file(&dir, "a.py", priority_py().as_bytes());
    h.write_file(&dir, "b.go", server_go().as_bytes());
    let folder_id = h.add_and_index(&dir).await;
    assert!(h.state.vectors.count(Some(&folder_id)).await.unwrap() > 0);

    let removed =
        h.call_ok("code_index_remove_folder", json!({ "folderId": folder_id })).await;
    assert_eq!(removed["removed"], 2);

    assert!(h.state.meta.get_folder(&folder_id).is_none());
    assert!(h.state.meta.files_by_folder(&folder_id).is_empty());
    assert_eq!(h.state.vectors.count(Some(&folder_id)).await.unwrap(), 0);

    // Searching afterwards returns nothing for the removed folder.
    let result =
        h.call_ok("code_index_search", json!({ "query": "priority task score" })).await;
    assert_eq!(result["results"].as_array().unwrap().len(), 0);
}

// ---------------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_folders_refuse_new_scans_until_resumed() {
    let h = TestHarness::new().await;
    let dir = h.project("pausable");
    h.write_file(&dir, "a.py", b"def a():\n    return 1\n");
    let folder_id = h.add_and_index(&dir).await;

    let paused = h.call_ok("code_index_pause", json!({ "folderId": folder_id })).await;
    assert_eq!(paused["status"], "paused");

    let (code, _) = h.call_err("code_index_scan", json!({ "folderId": folder_id })).await;
    assert_eq!(code, "conflict");

    // Data stays searchable while paused.
    let result = h.call_ok("code_index_search", json!({ "query": "def a" })).await;
    assert!(!result["results"].as_array().unwrap().is_empty());

    let before = codevec_server::meta::now_millis();
    let resumed = h.call_ok("code_index_resume", json!({ "folderId": folder_id })).await;
    assert_eq!(resumed["status"], "active");
    // Resume queues a catch-up scan.
    h.wait_for_scan(&folder_id, before).await;
}

// ---------------------------------------------------------------------------
// Queue backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overflowing_the_job_queue_is_resource_exhausted() {
    let h = TestHarness::new().await;
    let dir = h.project("queued");
    h.write_file(&dir, "a.py", b"x = 1\n");
    let folder_id = h.add_and_index(&dir).await;

    // The queue depth is finite; pile on jobs without waiting until one is
    // refused. Depth + in-flight slack means a few extra submissions.
    let mut refused = None;
    for _ in 0..(h.state.config.job_queue_depth + 8) {
        let response = h.call_tool("code_index_scan", json!({ "folderId": folder_id })).await;
        if let Some(error) = response.get("error") {
            refused = Some(error["code"].as_str().unwrap().to_string());
            break;
        }
    }
    assert_eq!(refused.as_deref(), Some("resource_exhausted"));
}
