//! Persistent vector store: `chunk id → (embedding, metadata, content)`.
//!
//! Flat-file JSON storage, no external DB. Cosine distance space
//! (`1 - cosine similarity`, range [0, 2], lower is better). The whole
//! map lives behind one `RwLock`, which gives readers a consistent
//! snapshot at `upsert`/`delete_where` granularity; persistence is a
//! temp-file-plus-rename so a crash never leaves a torn index on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::chunker::Chunk;
use crate::embedder::EmbeddedChunk;
use crate::error::{CoreError, CoreResult};

/// Upserts are applied atomically per batch; callers must stay at or
/// below this size.
pub const MAX_UPSERT_BATCH: usize = 1_000;

const INDEX_FILE: &str = "vector_index.json";
const META_FILE: &str = "index_meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: HashMap<String, StoredChunk>,
}

/// Guards against mixing embeddings from different models or chunking
/// configurations: a mismatch rebuilds the index from empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexMeta {
    embedding_model_id: String,
    chunk_size: usize,
}

/// Optional metadata filter for [`VectorStore::query`].
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub file_path: Option<String>,
}

impl ChunkFilter {
    pub fn for_file(path: impl Into<String>) -> Self {
        Self {
            file_path: Some(path.into()),
        }
    }

    fn matches(&self, chunk: &Chunk) -> bool {
        match &self.file_path {
            Some(path) => chunk.file_path == *path,
            None => true,
        }
    }
}

/// One query hit: the chunk plus its cosine distance to the query vector.
#[derive(Debug, Clone)]
pub struct Scored {
    pub chunk: Chunk,
    pub distance: f32,
}

pub struct VectorStore {
    index_path: PathBuf,
    inner: RwLock<IndexFile>,
}

impl VectorStore {
    /// Open (or create) the store under `state_dir`.
    pub fn open(state_dir: &Path, embedding_model_id: &str, chunk_size: usize) -> CoreResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let index_path = state_dir.join(INDEX_FILE);
        let meta_path = state_dir.join(META_FILE);

        let meta = IndexMeta {
            embedding_model_id: embedding_model_id.to_string(),
            chunk_size,
        };
        let disk_meta: Option<IndexMeta> = std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok());

        let mut index = load_index(&index_path);
        if disk_meta.as_ref() != Some(&meta) {
            if disk_meta.is_some() {
                tracing::info!("vector index config changed (model/chunking); rebuilding index");
            }
            index = IndexFile::default();
            let _ = std::fs::remove_file(&index_path);
        }
        std::fs::write(&meta_path, serde_json::to_string(&meta)?)?;

        Ok(Self {
            index_path,
            inner: RwLock::new(index),
        })
    }

    /// Insert or replace by chunk id. The batch becomes visible to
    /// readers all at once and is persisted before returning.
    pub fn upsert(&self, batch: Vec<EmbeddedChunk>) -> CoreResult<()> {
        if batch.len() > MAX_UPSERT_BATCH {
            return Err(CoreError::InvalidInput(format!(
                "upsert batch of {} exceeds the {MAX_UPSERT_BATCH} limit",
                batch.len()
            )));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self
            .inner
            .write()
            .map_err(|_| CoreError::Internal("vector store lock poisoned".into()))?;
        for item in batch {
            guard.entries.insert(
                item.chunk.id.clone(),
                StoredChunk {
                    chunk: item.chunk,
                    embedding: item.embedding,
                },
            );
        }
        persist(&self.index_path, &guard)
    }

    /// Remove every chunk belonging to `file_path`; returns the number
    /// removed. Runs to completion before any subsequent upsert of that
    /// file's new chunks can be observed.
    pub fn delete_where_file(&self, file_path: &str) -> CoreResult<usize> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| CoreError::Internal("vector store lock poisoned".into()))?;
        let before = guard.entries.len();
        guard.entries.retain(|_, stored| stored.chunk.file_path != file_path);
        let removed = before - guard.entries.len();
        if removed > 0 {
            persist(&self.index_path, &guard)?;
        }
        Ok(removed)
    }

    /// Top-`k` by cosine distance, optionally filtered by metadata.
    pub fn query(&self, vector: &[f32], k: usize, filter: Option<&ChunkFilter>) -> Vec<Scored> {
        let guard = match self.inner.read() {
            Ok(g) => g,
            Err(_) => return vec![],
        };

        let mut scored: Vec<Scored> = guard
            .entries
            .values()
            .filter(|stored| filter.map(|f| f.matches(&stored.chunk)).unwrap_or(true))
            .map(|stored| Scored {
                chunk: stored.chunk.clone(),
                distance: 1.0 - cosine_similarity(vector, &stored.embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        scored
    }

    pub fn chunks_for_file(&self, file_path: &str) -> Vec<Chunk> {
        let guard = match self.inner.read() {
            Ok(g) => g,
            Err(_) => return vec![],
        };
        let mut chunks: Vec<Chunk> = guard
            .entries
            .values()
            .filter(|s| s.chunk.file_path == file_path)
            .map(|s| s.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.start_line);
        chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.read().map(|g| g.entries.len()).unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        self.inner
            .read()
            .map(|g| {
                g.entries
                    .values()
                    .map(|s| s.chunk.file_path.as_str())
                    .collect::<std::collections::HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count() == 0
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

fn load_index(path: &Path) -> IndexFile {
    let Ok(text) = std::fs::read_to_string(path) else {
        return IndexFile::default();
    };
    match serde_json::from_str(&text) {
        Ok(index) => index,
        Err(err) => {
            tracing::warn!(%err, "vector index schema changed or corrupted, rebuilding");
            IndexFile::default()
        }
    }
}

fn persist(path: &Path, index: &IndexFile) -> CoreResult<()> {
    let text = serde_json::to_string(index)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{chunk_id, ChunkType};
    use crate::lang::Language;

    fn chunk(path: &str, start: u32, symbol: Option<&str>) -> Chunk {
        Chunk {
            id: chunk_id(path, start, start + 5, symbol),
            file_path: path.to_string(),
            language: Language::Python,
            chunk_type: ChunkType::Function,
            start_line: start,
            end_line: start + 5,
            symbol_name: symbol.map(str::to_string),
            parent_symbol: None,
            content: format!("def body_at_{start}(): pass"),
        }
    }

    fn embedded(path: &str, start: u32, symbol: Option<&str>, v: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(path, start, symbol),
            embedding: v,
        }
    }

    fn open_store(dir: &Path) -> VectorStore {
        VectorStore::open(dir, "model-a", 500).unwrap()
    }

    #[test]
    fn query_orders_by_cosine_distance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store
            .upsert(vec![
                embedded("a.py", 1, Some("near"), vec![1.0, 0.0]),
                embedded("b.py", 1, Some("far"), vec![0.0, 1.0]),
                embedded("c.py", 1, Some("mid"), vec![0.7, 0.7]),
            ])
            .unwrap();

        let hits = store.query(&[1.0, 0.0], 3, None);
        let names: Vec<&str> = hits
            .iter()
            .map(|h| h.chunk.symbol_name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["near", "mid", "far"]);
        assert!(hits[0].distance < 1e-6);
        assert!(hits.iter().all(|h| (0.0..=2.0).contains(&h.distance)));
    }

    #[test]
    fn filter_restricts_to_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store
            .upsert(vec![
                embedded("a.py", 1, None, vec![1.0, 0.0]),
                embedded("b.py", 1, None, vec![1.0, 0.0]),
            ])
            .unwrap();

        let hits = store.query(&[1.0, 0.0], 10, Some(&ChunkFilter::for_file("b.py")));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "b.py");
    }

    #[test]
    fn delete_where_file_removes_only_that_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store
            .upsert(vec![
                embedded("a.py", 1, None, vec![1.0]),
                embedded("a.py", 10, None, vec![1.0]),
                embedded("b.py", 1, None, vec![1.0]),
            ])
            .unwrap();

        assert_eq!(store.delete_where_file("a.py").unwrap(), 2);
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.delete_where_file("a.py").unwrap(), 0);
    }

    #[test]
    fn oversize_batch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let batch: Vec<EmbeddedChunk> = (0..=MAX_UPSERT_BATCH as u32)
            .map(|i| embedded("a.py", i + 1, None, vec![1.0]))
            .collect();
        let err = store.upsert(batch).unwrap_err();
        assert_eq!(err.category(), "invalid_input");
        assert!(store.is_empty());
    }

    #[test]
    fn upsert_replaces_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store.upsert(vec![embedded("a.py", 1, Some("f"), vec![1.0, 0.0])]).unwrap();
        store.upsert(vec![embedded("a.py", 1, Some("f"), vec![0.0, 1.0])]).unwrap();
        assert_eq!(store.chunk_count(), 1);
        let hits = store.query(&[0.0, 1.0], 1, None);
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn persists_across_reopen_and_rebuilds_on_model_change() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_store(tmp.path());
            store.upsert(vec![embedded("a.py", 1, None, vec![1.0])]).unwrap();
        }
        {
            let store = open_store(tmp.path());
            assert_eq!(store.chunk_count(), 1);
        }
        {
            // Different embedding model: stale vectors must not survive.
            let store = VectorStore::open(tmp.path(), "model-b", 500).unwrap();
            assert!(store.is_empty());
        }
    }
}
