//! `Embedder` trait and the two providers composed into an
//! `EmbeddingProvider` under a `remote_first`/`local_first` priority
//! policy, per SPEC_FULL.md §4.3.

use crate::error::{EmbeddingError, PromptError, Result};
use async_trait::async_trait;
use lru::LruCache;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A fixed-width vector producer. Implementations may be remote (network
/// call) or local (in-process model).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------
// Remote: OpenAI-compatible embeddings endpoint
// ---------------------------------------------------------------------

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    retries: u32,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAIResponseData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIResponseData>,
}

impl OpenAIEmbedder {
    pub fn new(api_key: String, model: String, dims: Option<usize>, retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| PromptError::Internal(format!("failed to build http client: {e}")))?;

        let dims = dims.unwrap_or(match model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            _ => 1536,
        });

        Ok(Self {
            client,
            api_key,
            model,
            dims,
            retries: retries.clamp(1, 10),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(model = %self.model, chars = text.len(), "generating remote embedding");

        let body = OpenAIRequest {
            model: &self.model,
            input: text,
            dimensions: if self.dims != 1536 && self.dims != 3072 {
                Some(self.dims)
            } else {
                None
            },
        };

        let mut last_err: Option<String> = None;
        for attempt in 0..self.retries {
            let send_res = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let response = match send_res {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(e.to_string());
                    backoff(attempt).await;
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                last_err = Some(format!("OpenAI API error {status}: {text}"));
                backoff(attempt).await;
                continue;
            }

            match response.json::<OpenAIResponse>().await {
                Ok(parsed) => {
                    return parsed
                        .data
                        .into_iter()
                        .next()
                        .map(|d| d.embedding)
                        .ok_or_else(|| {
                            EmbeddingError::Remote("no embedding returned from OpenAI".into())
                                .into()
                        });
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    backoff(attempt).await;
                }
            }
        }

        Err(EmbeddingError::Remote(
            last_err.unwrap_or_else(|| "unknown remote embedding error".into()),
        )
        .into())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

async fn backoff(attempt: u32) {
    let delay_ms = 200u64 * (1u64 << attempt.min(5));
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

// ---------------------------------------------------------------------
// Local: in-process model, loaded once behind a load-time lock
// ---------------------------------------------------------------------

/// Loads a model into process memory once (singleton keyed by
/// `(model_id, fp16, download_source)`) and serves calls synchronously to
/// it. Inference is not implemented; `embed` fails once the load-time
/// lock has been taken, which is enough to exercise the
/// remote-then-local fallback policy in `EmbeddingProvider` without a
/// real local runtime.
pub struct LocalEmbedder {
    model_id: String,
    dims: usize,
    loaded: OnceCell<()>,
}

impl LocalEmbedder {
    pub fn new(model_id: String, dims: usize) -> Self {
        Self {
            model_id,
            dims,
            loaded: OnceCell::new(),
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        self.loaded.get_or_try_init(|| {
            info!(model = %self.model_id, "resolving local embedding model (load-time lock)");
            Ok::<(), PromptError>(())
        })?;
        Ok(())
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        Err(EmbeddingError::Local(format!(
            "local inference for model '{}' is not yet implemented",
            self.model_id
        ))
        .into())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------
// Deterministic fallback for tests / offline development
// ---------------------------------------------------------------------

pub struct FakeEmbedder {
    dims: usize,
}

impl FakeEmbedder {
    pub fn new(dims: Option<usize>) -> Self {
        Self {
            dims: dims.unwrap_or(768).max(1),
        }
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let mut out = Vec::with_capacity(self.dims);
        let mut i: u32 = 0;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(i.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if out.len() >= self.dims {
                    break;
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(chunk);
                let v01 = (u32::from_le_bytes(bytes) as f32) / (u32::MAX as f32 + 1.0);
                out.push(v01 * 2.0 - 1.0);
            }
            i = i.wrapping_add(1);
        }

        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Stands in for both providers when `vector.enabled = false` (§6
/// configuration): always returns a zero vector of the configured
/// dimension rather than calling out to a model, so `EmbeddingProvider`
/// needs no special-casing for the disabled path.
pub struct NullEmbedder {
    dims: usize,
}

impl NullEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.0; self.dims])
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------
// Result cache: LRU+TTL keyed by (model_id, text), the teacher's own
// caching idiom applied to embedding results.
// ---------------------------------------------------------------------

struct ResultCache {
    inner: RwLock<LruCache<String, (Vec<f32>, Instant)>>,
    ttl: Duration,
}

impl ResultCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut cache = self.inner.write().unwrap();
        if let Some((vec, inserted)) = cache.get(key) {
            if inserted.elapsed() < self.ttl {
                return Some(vec.clone());
            }
        }
        cache.pop(key);
        None
    }

    fn put(&self, key: String, value: Vec<f32>) {
        self.inner.write().unwrap().put(key, (value, Instant::now()));
    }
}

/// Provider priority between the remote and local `Embedder`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPriority {
    RemoteFirst,
    LocalFirst,
}

/// Composes a remote and a local `Embedder` under a priority policy,
/// dimension-aligns every output, resolves the effective dimension lazily
/// per §4.3, and caches results.
pub struct EmbeddingProvider {
    remote: Option<Arc<dyn Embedder>>,
    local: Arc<dyn Embedder>,
    priority: ProviderPriority,
    configured_dimension: Option<usize>,
    model_name: String,
    cache: Option<ResultCache>,
    resolved_dimension: OnceCell<usize>,
}

impl EmbeddingProvider {
    pub fn new(
        remote: Option<Arc<dyn Embedder>>,
        local: Arc<dyn Embedder>,
        priority: ProviderPriority,
        configured_dimension: Option<usize>,
        model_name: String,
        result_cache_capacity: usize,
        result_cache_ttl: Duration,
    ) -> Self {
        Self {
            remote,
            local,
            priority,
            configured_dimension,
            model_name,
            cache: if result_cache_capacity > 0 {
                Some(ResultCache::new(result_cache_capacity, result_cache_ttl))
            } else {
                None
            },
            resolved_dimension: OnceCell::new(),
        }
    }

    fn should_use_local(&self, force: bool) -> bool {
        if force {
            return true;
        }
        match self.priority {
            ProviderPriority::LocalFirst => true,
            ProviderPriority::RemoteFirst => self.remote.is_none(),
        }
    }

    fn target_dimension(&self) -> usize {
        self.resolved_dimension
            .get()
            .copied()
            .or(self.configured_dimension)
            .unwrap_or(1536)
    }

    /// Truncate-or-zero-pad to the target dimension, per the exact
    /// `_align_dim` algorithm in the original embedding service.
    fn align_dim(&self, mut vec: Vec<f32>) -> Vec<f32> {
        let target = self.target_dimension();
        match vec.len().cmp(&target) {
            std::cmp::Ordering::Equal => vec,
            std::cmp::Ordering::Greater => {
                vec.truncate(target);
                vec
            }
            std::cmp::Ordering::Less => {
                vec.resize(target, 0.0);
                vec
            }
        }
    }

    fn cache_key(&self, text: &str) -> String {
        format!("emb:{}:{}", self.model_name, text)
    }

    pub async fn generate(&self, text: &str) -> Vec<f32> {
        let key = self.cache_key(text);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                return hit;
            }
        }

        let aligned = if self.should_use_local(false) {
            match self.local.embed(text).await {
                Ok(v) => self.align_dim(v),
                Err(e) => {
                    warn!(error = %e, "local embedding failed, substituting zero vector");
                    self.align_dim(vec![0.0; self.target_dimension()])
                }
            }
        } else {
            let remote = self.remote.as_ref().expect("remote selected but absent");
            match remote.embed(text).await {
                Ok(v) => self.align_dim(v),
                Err(e) => {
                    warn!(error = %e, "remote embedding failed, switching to local");
                    match self.local.embed(text).await {
                        Ok(v) => self.align_dim(v),
                        Err(e2) => {
                            warn!(error = %e2, "local embedding failed after remote error");
                            self.align_dim(vec![0.0; self.target_dimension()])
                        }
                    }
                }
            }
        };

        if let Some(cache) = &self.cache {
            cache.put(key, aligned.clone());
        }
        aligned
    }

    pub async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.should_use_local(false) {
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                out.push(self.generate(t).await);
            }
            return Ok(out);
        }
        let remote = self.remote.as_ref().expect("remote selected but absent");
        let mut out = Vec::with_capacity(texts.len());
        let mut remote_failed = false;
        for t in texts {
            match remote.embed(t).await {
                Ok(v) => out.push(self.align_dim(v)),
                Err(_) => {
                    remote_failed = true;
                    break;
                }
            }
        }
        if remote_failed {
            warn!("remote batch embedding failed, switching to local");
            let mut local_out = Vec::with_capacity(texts.len());
            for t in texts {
                match self.local.embed(t).await {
                    Ok(v) => local_out.push(self.align_dim(v)),
                    Err(e) => {
                        return Err(EmbeddingError::Exhausted(e.to_string()).into());
                    }
                }
            }
            return Ok(local_out);
        }
        Ok(out)
    }

    /// Resolves the effective output dimension exactly per the five-step
    /// priority order in §4.3, and caches the result for the life of the
    /// provider so it never varies per request (§9).
    pub async fn dimension(&self) -> usize {
        if let Some(d) = self.resolved_dimension.get() {
            return *d;
        }
        let resolved = self.resolve_dimension_uncached().await;
        let _ = self.resolved_dimension.set(resolved);
        resolved
    }

    async fn resolve_dimension_uncached(&self) -> usize {
        if let Some(d) = self.configured_dimension {
            return d;
        }
        if self.should_use_local(false) {
            return self.local.dimensions();
        }
        let name = self.model_name.to_lowercase();
        if name.contains("text-embedding-3-large") {
            return 3072;
        }
        if name.contains("text-embedding-3-small") || name.contains("ada-002") {
            return 1536;
        }
        if let Some(remote) = &self.remote {
            if let Ok(v) = remote.embed("test").await {
                return v.len();
            }
        }
        1536
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_embedder_always_returns_zero_vector() {
        let ne = NullEmbedder::new(16);
        let v = ne.embed("anything").await.unwrap();
        assert_eq!(v, vec![0.0; 16]);
    }

    #[tokio::test]
    async fn fake_embedder_is_deterministic() {
        let fe = FakeEmbedder::new(Some(128));
        let a1 = fe.embed("hello world").await.unwrap();
        let a2 = fe.embed("hello world").await.unwrap();
        assert_eq!(a1.len(), 128);
        assert!(a1.iter().zip(&a2).all(|(x, y)| (x - y).abs() < 1e-8));
    }

    #[tokio::test]
    async fn fake_embedder_varies_with_input() {
        let fe = FakeEmbedder::new(None);
        let a = fe.embed("foo").await.unwrap();
        let b = fe.embed("bar").await.unwrap();
        assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[tokio::test]
    async fn align_dim_truncates_and_pads() {
        let provider = EmbeddingProvider::new(
            None,
            Arc::new(FakeEmbedder::new(Some(4))),
            ProviderPriority::LocalFirst,
            Some(6),
            "test-model".into(),
            0,
            Duration::from_secs(60),
        );
        let short = provider.align_dim(vec![1.0, 2.0]);
        assert_eq!(short, vec![1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        let long = provider.align_dim(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(long, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[tokio::test]
    async fn dimension_resolution_prefers_explicit_config() {
        let provider = EmbeddingProvider::new(
            None,
            Arc::new(FakeEmbedder::new(Some(128))),
            ProviderPriority::LocalFirst,
            Some(42),
            "test-model".into(),
            0,
            Duration::from_secs(60),
        );
        assert_eq!(provider.dimension().await, 42);
    }

    #[tokio::test]
    async fn dimension_resolution_falls_back_to_local_probe() {
        let provider = EmbeddingProvider::new(
            None,
            Arc::new(FakeEmbedder::new(Some(256))),
            ProviderPriority::LocalFirst,
            None,
            "test-model".into(),
            0,
            Duration::from_secs(60),
        );
        assert_eq!(provider.dimension().await, 256);
    }

    #[tokio::test]
    async fn result_cache_avoids_recomputation_and_respects_ttl() {
        let provider = EmbeddingProvider::new(
            None,
            Arc::new(FakeEmbedder::new(Some(8))),
            ProviderPriority::LocalFirst,
            Some(8),
            "m".into(),
            100,
            Duration::from_millis(20),
        );
        let first = provider.generate("cached text").await;
        let second = provider.generate("cached text").await;
        assert_eq!(first, second);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // after TTL expiry the cache entry is gone; regenerating a
        // deterministic fake embedder still yields the same vector, but
        // we at least exercise the eviction path without panicking.
        let third = provider.generate("cached text").await;
        assert_eq!(third, first);
    }
}
