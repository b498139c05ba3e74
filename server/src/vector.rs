//! Vector store adapter. Translates our point/payload shape to the store's
//! native shape and nothing more; all business rules live above. Two
//! backends: the Qdrant REST API and an in-process brute-force store used
//! by tests and store-less deployments.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload carried with every vector point. Keys are the wire contract for
/// search results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PointPayload {
    pub folder_id: String,
    pub file_id: String,
    pub relative_path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    // Absent on the wire when no language was detected; must round-trip
    // back from the store without the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content_hash: String,
}

/// A point keyed by chunkId. Ids are content-derived, so upserts are
/// naturally at-least-once safe.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// Optional payload predicate for queries.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub folder_id: Option<String>,
    pub language: Option<String>,
}

impl SearchFilter {
    fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(folder_id) = &self.folder_id {
            if &payload.folder_id != folder_id {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if payload.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One search hit with its score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// Store contract. Upserts are batched and keyed by chunkId; deletes accept
/// explicit ids or a folder filter.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent: create the collection if absent, verify dimension and
    /// metric if present. Fails fast on mismatch.
    async fn ensure_collection(&self) -> Result<()>;
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn delete_by_folder(&self, folder_id: &str) -> Result<()>;
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>>;
    /// Exact point count, optionally restricted to one folder.
    async fn count(&self, folder_id: Option<&str>) -> Result<usize>;
}

/// Build the backend selected by configuration.
pub fn build_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    match config.vector_backend.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(config)?)),
        "memory" => Ok(Arc::new(MemoryVectorStore::new(config.vector_dimension))),
        other => Err(Error::InvalidArgument(format!("unknown vectorBackend '{other}'"))),
    }
}

/// Cosine similarity mapped from `[-1, 1]` into the `[0, 1]` score contract,
/// applied uniformly across backends.
fn normalize_score(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Qdrant REST backend
// ---------------------------------------------------------------------------

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

const UPSERT_BATCH: usize = 128;

impl QdrantStore {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.vector_url.trim_end_matches('/').to_string(),
            collection: config.vector_collection.clone(),
            dimension: config.vector_dimension,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{suffix}", self.base_url, self.collection)
    }

    async fn check(&self, response: reqwest::Response, action: &str) -> Result<serde_json::Value> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::PermanentDependency(format!("{action}: {e}")));
        }
        let detail = response.text().await.unwrap_or_default();
        let message = format!("{action} returned {status}: {detail}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::TransientDependency(message))
        } else {
            Err(Error::PermanentDependency(message))
        }
    }

    async fn post(&self, url: &str, body: serde_json::Value, action: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::TransientDependency(format!("{action}: {e}")))?;
        self.check(response, action).await
    }

    fn filter_json(filter: &SearchFilter) -> Option<serde_json::Value> {
        let mut must = Vec::new();
        if let Some(folder_id) = &filter.folder_id {
            must.push(serde_json::json!({ "key": "folderId", "match": { "value": folder_id } }));
        }
        if let Some(language) = &filter.language {
            must.push(serde_json::json!({ "key": "language", "match": { "value": language } }));
        }
        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "must": must }))
        }
    }

    fn folder_filter(folder_id: &str) -> serde_json::Value {
        serde_json::json!({
            "must": [{ "key": "folderId", "match": { "value": folder_id } }]
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self) -> Result<()> {
        let url = self.collection_url("");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::TransientDependency(format!("get collection: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let body = serde_json::json!({
                "vectors": { "size": self.dimension, "distance": "Cosine" }
            });
            let create = self
                .client
                .put(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::TransientDependency(format!("create collection: {e}")))?;
            self.check(create, "create collection").await?;
            tracing::info!(collection = self.collection.as_str(), dim = self.dimension, "Created vector collection");
            return Ok(());
        }

        let info = self.check(response, "get collection").await?;
        let params = &info["result"]["config"]["params"]["vectors"];
        let size = params["size"].as_u64().unwrap_or(0) as usize;
        let distance = params["distance"].as_str().unwrap_or("");
        if size != self.dimension || distance != "Cosine" {
            return Err(Error::PermanentDependency(format!(
                "collection '{}' has size={size} distance={distance}, expected size={} distance=Cosine",
                self.collection, self.dimension
            )));
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        for batch in points.chunks(UPSERT_BATCH) {
            let wire: Vec<serde_json::Value> = batch
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "id": p.id,
                        "vector": p.vector,
                        "payload": p.payload,
                    })
                })
                .collect();
            let url = format!("{}?wait=true", self.collection_url("/points"));
            let response = self
                .client
                .put(&url)
                .json(&serde_json::json!({ "points": wire }))
                .send()
                .await
                .map_err(|e| Error::TransientDependency(format!("upsert points: {e}")))?;
            self.check(response, "upsert points").await?;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}?wait=true", self.collection_url("/points/delete"));
        self.post(&url, serde_json::json!({ "points": ids }), "delete points").await?;
        Ok(())
    }

    async fn delete_by_folder(&self, folder_id: &str) -> Result<()> {
        let url = format!("{}?wait=true", self.collection_url("/points/delete"));
        self.post(&url, serde_json::json!({ "filter": Self::folder_filter(folder_id) }), "delete by folder")
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter_json) = Self::filter_json(filter) {
            body["filter"] = filter_json;
        }
        let parsed = self.post(&self.collection_url("/points/search"), body, "search points").await?;
        let hits = parsed["result"].as_array().cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload: PointPayload = serde_json::from_value(hit["payload"].clone())
                .map_err(|e| Error::PermanentDependency(format!("search payload: {e}")))?;
            let id = match &hit["id"] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let score = hit["score"].as_f64().unwrap_or(0.0) as f32;
            results.push(ScoredPoint { id, score: normalize_score(score), payload });
        }
        Ok(results)
    }

    async fn count(&self, folder_id: Option<&str>) -> Result<usize> {
        let mut body = serde_json::json!({ "exact": true });
        if let Some(folder_id) = folder_id {
            body["filter"] = Self::folder_filter(folder_id);
        }
        let parsed = self.post(&self.collection_url("/points/count"), body, "count points").await?;
        Ok(parsed["result"]["count"].as_u64().unwrap_or(0) as usize)
    }
}

// ---------------------------------------------------------------------------
// In-process backend (brute-force cosine)
// ---------------------------------------------------------------------------

/// Exhaustive-scan store. O(n·d) per query, which is fine for the folder
/// sizes it is meant for (tests, small deployments without Qdrant).
pub struct MemoryVectorStore {
    points: DashMap<String, (Vec<f32>, PointPayload)>,
    dimension: usize,
}

impl MemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self { points: DashMap::new(), dimension }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        for point in points {
            if point.vector.len() != self.dimension {
                return Err(Error::PermanentDependency(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    self.dimension,
                    point.vector.len()
                )));
            }
            self.points.insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.points.remove(id);
        }
        Ok(())
    }

    async fn delete_by_folder(&self, folder_id: &str) -> Result<()> {
        self.points.retain(|_, (_, payload)| payload.folder_id != folder_id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let mut scored: Vec<ScoredPoint> = self
            .points
            .iter()
            .filter(|entry| filter.matches(&entry.value().1))
            .map(|entry| {
                let (stored, payload) = entry.value();
                ScoredPoint {
                    id: entry.key().clone(),
                    score: normalize_score(cosine(vector, stored)),
                    payload: payload.clone(),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn count(&self, folder_id: Option<&str>) -> Result<usize> {
        Ok(match folder_id {
            Some(folder_id) => {
                self.points.iter().filter(|e| e.value().1.folder_id == folder_id).count()
            }
            None => self.points.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(folder: &str, rel: &str, language: Option<&str>) -> PointPayload {
        PointPayload {
            folder_id: folder.to_string(),
            file_id: "file".to_string(),
            relative_path: rel.to_string(),
            chunk_index: 0,
            start_line: 1,
            end_line: 10,
            language: language.map(|l| l.to_string()),
            content_hash: "h".to_string(),
        }
    }

    fn point(id: &str, vector: Vec<f32>, folder: &str, language: Option<&str>) -> VectorPoint {
        VectorPoint { id: id.to_string(), vector, payload: payload(folder, "a.rs", language) }
    }

    #[tokio::test]
    async fn query_ranks_by_cosine() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "f1", None),
                point("b", vec![0.0, 1.0], "f1", None),
            ])
            .await
            .unwrap();
        let hits = store.query(&[1.0, 0.1], 10, &SearchFilter::default()).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.score));
        }
    }

    #[tokio::test]
    async fn filter_restricts_folder_and_language() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "f1", Some("rust")),
                point("b", vec![1.0, 0.0], "f2", Some("python")),
            ])
            .await
            .unwrap();
        let filter = SearchFilter { folder_id: Some("f1".to_string()), language: None };
        let hits = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let filter = SearchFilter { folder_id: None, language: Some("python".to_string()) };
        let hits = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn delete_by_folder_removes_only_that_folder() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "f1", None),
                point("b", vec![0.0, 1.0], "f2", None),
            ])
            .await
            .unwrap();
        store.delete_by_folder("f1").await.unwrap();
        assert_eq!(store.count(Some("f1")).await.unwrap(), 0);
        assert_eq!(store.count(Some("f2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let store = MemoryVectorStore::new(4);
        let err = store.upsert(vec![point("a", vec![1.0], "f1", None)]).await.unwrap_err();
        assert_eq!(err.kind(), "permanent_dependency");
    }

    #[test]
    fn payload_without_language_round_trips_through_json() {
        // Qdrant persists the serialized payload verbatim and echoes it back
        // in search hits; a payload with no detected language must survive
        // that round trip with the key absent.
        let original = payload("f1", "Makefile", None);
        let wire = serde_json::to_value(&original).unwrap();
        assert!(wire.get("language").is_none(), "language key should be omitted: {wire}");
        let back: PointPayload = serde_json::from_value(wire).unwrap();
        assert_eq!(back, original);

        // And with a language present it comes back intact.
        let original = payload("f1", "a.rs", Some("rust"));
        let wire = serde_json::to_value(&original).unwrap();
        let back: PointPayload = serde_json::from_value(wire).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn qdrant_filter_shape_matches_the_payload_keys() {
        let filter = SearchFilter {
            folder_id: Some("f1".to_string()),
            language: Some("rust".to_string()),
        };
        let wire = QdrantStore::filter_json(&filter).unwrap();
        assert_eq!(wire["must"][0]["key"], "folderId");
        assert_eq!(wire["must"][0]["match"]["value"], "f1");
        assert_eq!(wire["must"][1]["key"], "language");
        assert_eq!(wire["must"][1]["match"]["value"], "rust");
        assert!(QdrantStore::filter_json(&SearchFilter::default()).is_none());
    }
}
