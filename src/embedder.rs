//! Vector generation: provider abstraction, char-budgeted batching,
//! retry, and a TTL'd query-embedding cache.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use model2vec_rs::model::StaticModel;

use crate::cache::DiskCache;
use crate::chunker::{format_for_embedding, Chunk};
use crate::error::{CoreError, CoreResult};
use crate::retry::{with_retry, RetryPolicy};

/// Conservative per-request character budget, well below the provider's
/// actual per-request ceiling.
pub const MAX_BATCH_CHARS: usize = 30_000;

/// TTL for cached query embeddings.
pub const QUERY_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Deadline for one embedding HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Contract with the embedding backend: `embed` maps each input text to
/// one fixed-dimension vector, in order. Transient failures are reported
/// as [`CoreError::Transient`] so callers can retry.
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// Local provider: static embeddings pulled from the HuggingFace Hub.
// ---------------------------------------------------------------------------

pub struct LocalEmbeddingProvider {
    model: StaticModel,
    model_id: String,
}

impl LocalEmbeddingProvider {
    pub fn load(model_id: &str) -> CoreResult<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| CoreError::Unavailable(format!("embedding model {model_id}: {e}")))?;
        Ok(Self {
            model,
            model_id: model_id.to_string(),
        })
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.model.encode_single(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// HTTP provider: OpenAI-compatible /embeddings endpoint.
// ---------------------------------------------------------------------------

pub struct HttpEmbeddingProvider {
    endpoint: String,
    api_key: String,
    model_id: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model_id: model_id.into(),
        }
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let response = ureq::post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(serde_json::json!({
                "model": self.model_id,
                "input": texts,
            }));

        let response = match response {
            Ok(r) => r,
            // Rate limits and server-side failures are retryable.
            Err(ureq::Error::Status(code, r)) if code == 429 || code >= 500 => {
                return Err(CoreError::Transient(format!(
                    "embedding endpoint returned {code}: {}",
                    r.status_text()
                )));
            }
            Err(ureq::Error::Status(code, r)) => {
                return Err(CoreError::InvalidInput(format!(
                    "embedding endpoint returned {code}: {}",
                    r.status_text()
                )));
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(CoreError::Transient(format!("embedding transport: {t}")));
            }
        };

        let parsed: EmbeddingResponse = response
            .into_json()
            .map_err(|e| CoreError::Internal(format!("embedding response decode: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(CoreError::Internal(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// Embedder: batching + retry + query cache over a provider.
// ---------------------------------------------------------------------------

/// A chunk paired with its embedding, ready for the vector store.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    query_cache: Option<DiskCache>,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, query_cache: Option<DiskCache>) -> Self {
        Self {
            provider,
            query_cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// Embed chunks in sub-batches bounded by [`MAX_BATCH_CHARS`]: when
    /// adding the next formatted text would exceed the budget, the current
    /// sub-batch is flushed first. Per-input token limits were already
    /// enforced by chunk splitting.
    pub fn embed_chunks(&self, chunks: Vec<Chunk>) -> CoreResult<Vec<EmbeddedChunk>> {
        let mut out: Vec<EmbeddedChunk> = Vec::with_capacity(chunks.len());

        let mut batch: Vec<Chunk> = Vec::new();
        let mut batch_texts: Vec<String> = Vec::new();
        let mut batch_chars = 0usize;

        for chunk in chunks {
            let text = format_for_embedding(&chunk);
            if batch_chars + text.len() > MAX_BATCH_CHARS && !batch_texts.is_empty() {
                self.flush(&mut batch, &mut batch_texts, &mut out)?;
                batch_chars = 0;
            }
            batch_chars += text.len();
            batch_texts.push(text);
            batch.push(chunk);
        }
        self.flush(&mut batch, &mut batch_texts, &mut out)?;

        Ok(out)
    }

    fn flush(
        &self,
        batch: &mut Vec<Chunk>,
        batch_texts: &mut Vec<String>,
        out: &mut Vec<EmbeddedChunk>,
    ) -> CoreResult<()> {
        if batch_texts.is_empty() {
            return Ok(());
        }
        let vectors = with_retry(self.retry, "embed_batch", || {
            self.provider.embed(batch_texts)
        })?;
        if vectors.len() != batch.len() {
            return Err(CoreError::Internal(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for (chunk, embedding) in batch.drain(..).zip(vectors) {
            out.push(EmbeddedChunk { chunk, embedding });
        }
        batch_texts.clear();
        Ok(())
    }

    /// Embed a retrieval query, short-circuiting through the 24 h cache
    /// keyed by `(model_id, sha256(query))`.
    pub fn embed_query(&self, query: &str) -> CoreResult<Vec<f32>> {
        let key = format!(
            "embedding::{}::{:x}",
            self.provider.model_id(),
            Sha256::digest(query.as_bytes())
        );

        if let Some(cache) = &self.query_cache {
            if let Some(vector) = cache.get::<Vec<f32>>(&key) {
                return Ok(vector);
            }
        }

        let texts = vec![query.to_string()];
        let mut vectors = with_retry(self.retry, "embed_query", || self.provider.embed(&texts))?;
        let vector = vectors
            .pop()
            .ok_or_else(|| CoreError::Internal("provider returned no vector".into()))?;

        if let Some(cache) = &self.query_cache {
            cache.set(&key, &vector, Some(QUERY_CACHE_TTL));
        }
        Ok(vector)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic provider for tests: programmed vectors by exact text
    /// prefix match, otherwise a hash-derived unit vector.
    pub struct FakeEmbeddingProvider {
        pub programmed: Mutex<HashMap<String, Vec<f32>>>,
        pub calls: AtomicUsize,
        pub fail_first: AtomicUsize,
        /// Any request containing this substring fails with Transient.
        pub fail_substring: Mutex<Option<String>>,
        pub dimension: usize,
    }

    impl FakeEmbeddingProvider {
        pub fn new(dimension: usize) -> Self {
            Self {
                programmed: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                fail_substring: Mutex::new(None),
                dimension,
            }
        }

        pub fn program(&self, needle: &str, vector: Vec<f32>) {
            self.programmed
                .lock()
                .unwrap()
                .insert(needle.to_string(), vector);
        }

        fn vector_for(&self, text: &str) -> Vec<f32> {
            let programmed = self.programmed.lock().unwrap();
            for (needle, vector) in programmed.iter() {
                if text.contains(needle.as_str()) {
                    return vector.clone();
                }
            }
            // Hash-derived fallback so distinct texts stay distinct.
            let h = xxhash_rust::xxh3::xxh3_64(text.as_bytes());
            (0..self.dimension)
                .map(|i| (((h >> (i % 57)) & 0xff) as f32) / 255.0)
                .collect()
        }
    }

    impl EmbeddingProvider for FakeEmbeddingProvider {
        fn model_id(&self) -> &str {
            "fake-embedder"
        }

        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::Transient("injected failure".into()));
            }
            if let Some(needle) = self.fail_substring.lock().unwrap().as_deref() {
                if texts.iter().any(|t| t.contains(needle)) {
                    return Err(CoreError::Transient("injected failure".into()));
                }
            }
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeEmbeddingProvider;
    use super::*;
    use crate::chunker::{chunk_id, ChunkType};
    use crate::lang::Language;
    use std::sync::atomic::Ordering;

    fn chunk_with_content(path: &str, content: String) -> Chunk {
        Chunk {
            id: chunk_id(path, 1, 1, None),
            file_path: path.to_string(),
            language: Language::Python,
            chunk_type: ChunkType::Block,
            start_line: 1,
            end_line: 1,
            symbol_name: None,
            parent_symbol: None,
            content,
        }
    }

    #[test]
    fn batches_flush_at_the_char_budget() {
        let provider = Arc::new(FakeEmbeddingProvider::new(8));
        let embedder = Embedder::new(provider.clone(), None)
            .with_retry_policy(RetryPolicy::immediate(1));

        // Four ~12k-char chunks: budget fits two per request.
        let chunks: Vec<Chunk> = (0..4)
            .map(|i| chunk_with_content(&format!("f{i}.py"), "x".repeat(12_000)))
            .collect();
        let embedded = embedder.embed_chunks(chunks).unwrap();

        assert_eq!(embedded.len(), 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transient_provider_errors_are_retried() {
        let provider = Arc::new(FakeEmbeddingProvider::new(4));
        provider.fail_first.store(2, Ordering::SeqCst);
        let embedder = Embedder::new(provider.clone(), None)
            .with_retry_policy(RetryPolicy::immediate(3));

        let embedded = embedder
            .embed_chunks(vec![chunk_with_content("a.py", "pass".into())])
            .unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn query_embeddings_are_cached_by_model_and_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path().join("cache"), QUERY_CACHE_TTL).unwrap();
        let provider = Arc::new(FakeEmbeddingProvider::new(4));
        let embedder = Embedder::new(provider.clone(), Some(cache))
            .with_retry_policy(RetryPolicy::immediate(1));

        let first = embedder.embed_query("how does checksum work").unwrap();
        let second = embedder.embed_query("how does checksum work").unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        embedder.embed_query("a different query").unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
