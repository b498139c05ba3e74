//! Embedding client. Batches of chunk texts go to an external provider and
//! come back as fixed-dimension vectors, same length, same order. The HTTP
//! client classifies failures as transient or permanent; retry policy lives
//! in [`with_retries`], shared by the pipeline and the search path.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Contract for embedding providers. `embed` returns one vector per input,
/// in input order; the dimension is fixed per provider and checked against
/// the vector store at startup.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
    /// Number of provider calls issued so far (status reporting, tests).
    fn calls(&self) -> usize;
}

/// Build the provider selected by configuration.
pub fn build_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embed_provider.as_str() {
        "http" => Ok(Arc::new(HttpEmbeddingClient::new(config)?)),
        "local" => Ok(Arc::new(LocalHashEmbedder::new(config.vector_dimension))),
        other => Err(Error::InvalidArgument(format!("unknown embedProvider '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Retry with exponential backoff and jitter
// ---------------------------------------------------------------------------

/// Retry `op` on transient errors with exponential backoff and jitter.
/// Permanent errors and cancellation return immediately.
pub async fn with_retries<T, F, Fut>(
    max_retries: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Internal("operation cancelled".to_string()));
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after transient failure");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(Error::Internal("operation cancelled".to_string()));
                    }
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `250ms * 2^attempt`, capped at 30s, with ±50% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(10));
    let capped = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

// ---------------------------------------------------------------------------
// HTTP provider (OpenAI/Voyage-shaped REST API)
// ---------------------------------------------------------------------------

/// External embedding provider over HTTP. Requests are `{model, input}`
/// JSON bodies; responses carry one embedding per input. Outstanding
/// batches are capped by a global semaphore.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    permits: Semaphore,
    call_count: AtomicUsize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embed_timeout_seconds))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        let api_key = std::env::var(&config.embed_api_key_env).ok().filter(|k| !k.is_empty());
        Ok(Self {
            client,
            endpoint: config.embed_endpoint.clone(),
            api_key,
            model: config.embed_model.clone(),
            dimension: config.vector_dimension,
            permits: Semaphore::new(config.embed_concurrency),
            call_count: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if inputs.iter().any(|i| i.is_empty()) {
            return Err(Error::InvalidArgument("empty string in embedding batch".to_string()));
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("embedding semaphore closed".to_string()))?;
        self.call_count.fetch_add(1, Ordering::Relaxed);

        let body = serde_json::json!({ "model": self.model, "input": inputs });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            // Timeouts and transport failures are retryable.
            Error::TransientDependency(format!("embedding request: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("embedding provider returned {status}: {detail}");
            return if status.as_u16() == 429 || status.as_u16() == 408 || status.is_server_error()
            {
                Err(Error::TransientDependency(message))
            } else {
                Err(Error::PermanentDependency(message))
            };
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::PermanentDependency(format!("embedding response: {e}")))?;
        if parsed.data.len() != inputs.len() {
            return Err(Error::PermanentDependency(format!(
                "embedding count mismatch: sent {}, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(Error::PermanentDependency(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }
        Ok(vectors)
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Local deterministic provider (feature hashing)
// ---------------------------------------------------------------------------

/// In-process fallback provider: L2-normalized bag-of-words feature hashing.
/// Deterministic, dependency-free, and good enough for hermetic runs and
/// tests; shared tokens between query and chunk produce a high cosine score.
pub struct LocalHashEmbedder {
    dimension: usize,
    call_count: AtomicUsize,
}

impl LocalHashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, call_count: AtomicUsize::new(0) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) as usize) % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// Lowercased alphanumeric tokens with a crude plural/verb-s strip so
/// "computes" and "compute" land in the same bucket.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let lower = t.to_lowercase();
            if lower.len() > 3 && lower.ends_with('s') {
                lower[..lower.len() - 1].to_string()
            } else {
                lower
            }
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for LocalHashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}
