//! Full and single-file indexing: Scanner → Chunker → Embedder →
//! Vector Store, with the Code Graph rebuilt alongside.
//!
//! Full indexing fans chunking out over a bounded worker pool; the
//! embedding stage stays a single producer so provider batching and
//! store back-pressure remain in one place. Per-file failures are
//! logged and counted, never fatal to the run.

use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use crate::chunker::{Chunk, Chunker};
use crate::code_graph::CodeGraph;
use crate::embedder::{EmbeddedChunk, Embedder};
use crate::error::{CoreError, CoreResult};
use crate::scanner::{classify, scan_workspace, ScanOptions};
use crate::vector_store::{VectorStore, MAX_UPSERT_BATCH};

/// Bounded fan-out for the chunking stage of a full index.
pub const INDEX_WORKERS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub chunks_created: usize,
    pub embeddings_stored: usize,
    pub duration: Duration,
}

pub struct IndexEngine {
    workspace_root: PathBuf,
    scan_opts: ScanOptions,
    chunker: Chunker,
    embedder: Embedder,
    store: Arc<VectorStore>,
    graph: Arc<RwLock<CodeGraph>>,
    /// Files currently being reindexed; keeps concurrent callers from
    /// interleaving delete/upsert for the same path.
    in_flight: Mutex<HashSet<String>>,
}

impl IndexEngine {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        scan_opts: ScanOptions,
        chunker: Chunker,
        embedder: Embedder,
        store: Arc<VectorStore>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            scan_opts,
            chunker,
            embedder,
            store,
            graph: Arc::new(RwLock::new(CodeGraph::default())),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    /// Read access to the current code graph. Rebuilds swap the whole
    /// graph, so readers always see a complete version.
    pub fn graph(&self) -> RwLockReadGuard<'_, CodeGraph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Index the whole workspace. `progress` is invoked after each file
    /// finishes chunking with `(done, total)`.
    pub fn index_workspace(
        &self,
        progress: Option<&(dyn Fn(usize, usize) + Sync)>,
    ) -> CoreResult<IndexReport> {
        let started = Instant::now();
        let entries = scan_workspace(&self.scan_opts)?;
        let total = entries.len();

        // Stage 1: parallel chunking with a bounded pool.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(INDEX_WORKERS.min(total.max(1)))
            .build()
            .map_err(|e| CoreError::Internal(format!("worker pool: {e}")))?;
        let done = AtomicUsize::new(0);
        let chunked: Vec<(String, CoreResult<Vec<Chunk>>)> = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    let result = self.chunker.chunk_file(entry);
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(cb) = progress {
                        cb(finished, total);
                    }
                    (entry.rel_key(), result)
                })
                .collect()
        });

        // Stage 2: single-producer embedding + per-file upsert.
        let mut report = IndexReport {
            files_scanned: total,
            ..IndexReport::default()
        };
        for (rel, result) in chunked {
            match result {
                Ok(chunks) => {
                    report.chunks_created += chunks.len();
                    match self.replace_file_chunks(&rel, chunks) {
                        Ok(stored) => {
                            report.embeddings_stored += stored;
                            report.files_indexed += 1;
                        }
                        Err(err) => {
                            report.files_failed += 1;
                            tracing::warn!(file = %rel, %err, "indexing failed");
                        }
                    }
                }
                Err(err) => {
                    report.files_failed += 1;
                    tracing::warn!(file = %rel, %err, "chunking failed");
                }
            }
        }

        // Stage 3: rebuild the code graph and swap it in.
        match CodeGraph::build(&entries) {
            Ok(new_graph) => {
                let mut guard = self.graph.write().unwrap_or_else(|e| e.into_inner());
                *guard = new_graph;
            }
            Err(err) => tracing::warn!(%err, "code graph rebuild failed, keeping previous graph"),
        }

        report.duration = started.elapsed();
        tracing::info!(
            files = report.files_indexed,
            failed = report.files_failed,
            chunks = report.chunks_created,
            elapsed_ms = report.duration.as_millis() as u64,
            "workspace index complete"
        );
        Ok(report)
    }

    /// Delete-then-reindex one file from disk. A vanished file is
    /// treated as a removal. Returns the number of chunks stored.
    pub fn reindex_file(&self, abs_path: &Path) -> CoreResult<usize> {
        let Some(rel) = self.rel_key_for(abs_path) else {
            return Ok(0);
        };

        let _guard = match FileGuard::acquire(&self.in_flight, &rel) {
            Some(g) => g,
            None => {
                tracing::debug!(file = %rel, "reindex already in flight, skipping");
                return Ok(0);
            }
        };

        if !abs_path.exists() {
            self.store.delete_where_file(&rel)?;
            return Ok(0);
        }
        let Some(entry) = classify(&self.workspace_root, abs_path, self.scan_opts.max_file_bytes)
        else {
            // Not an indexable file (filtered out); drop any stale chunks.
            self.store.delete_where_file(&rel)?;
            return Ok(0);
        };

        let chunks = self.chunker.chunk_file(&entry)?;
        self.replace_file_chunks(&rel, chunks)
    }

    /// Remove a file's chunks (watcher delete events).
    pub fn remove_file(&self, abs_path: &Path) -> CoreResult<usize> {
        let Some(rel) = self.rel_key_for(abs_path) else {
            return Ok(0);
        };
        self.store.delete_where_file(&rel)
    }

    /// Embed and store a file's new chunk set. The old set is deleted
    /// first and the new set staged as complete batches, so a failure
    /// mid-way leaves either the pre-state intact or nothing for the
    /// file, never a mix of old and new chunks.
    fn replace_file_chunks(&self, rel: &str, chunks: Vec<Chunk>) -> CoreResult<usize> {
        if chunks.is_empty() {
            self.store.delete_where_file(rel)?;
            return Ok(0);
        }

        // Embed before touching the store; an embedding failure must not
        // lose the existing index entries.
        let embedded: Vec<EmbeddedChunk> = self.embedder.embed_chunks(chunks)?;
        let stored = embedded.len();

        self.store.delete_where_file(rel)?;
        for batch in chunks_of(embedded, MAX_UPSERT_BATCH) {
            self.store.upsert(batch)?;
        }
        Ok(stored)
    }

    fn rel_key_for(&self, abs_path: &Path) -> Option<String> {
        abs_path
            .strip_prefix(&self.workspace_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

fn chunks_of<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out: Vec<Vec<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    for item in items {
        if current.len() == size {
            out.push(std::mem::take(&mut current));
        }
        current.push(item);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// RAII entry in the in-flight set.
struct FileGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> FileGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set,
            key: key.to_string(),
        })
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::test_support::FakeEmbeddingProvider;
    use crate::retry::RetryPolicy;

    fn engine_for(root: &Path) -> (Arc<FakeEmbeddingProvider>, IndexEngine) {
        let provider = Arc::new(FakeEmbeddingProvider::new(8));
        let embedder = Embedder::new(provider.clone(), None)
            .with_retry_policy(RetryPolicy::immediate(1));
        let store = Arc::new(
            VectorStore::open(&root.join(".codegrounds"), "fake-embedder", 40).unwrap(),
        );
        let engine = IndexEngine::new(
            root,
            ScanOptions::new(root),
            Chunker::new(40, 5),
            embedder,
            store,
        );
        (provider, engine)
    }

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let p = root.join(rel);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn full_index_stores_chunks_and_builds_the_graph() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "app.py",
            "import os\n\ndef main():\n    return helper()\n\ndef helper():\n    return 1\n",
        );
        write(tmp.path(), "lib.py", "def helper():\n    return 2\n");

        let (_provider, engine) = engine_for(tmp.path());
        let seen = AtomicUsize::new(0);
        let report = engine
            .index_workspace(Some(&|done, total| {
                seen.fetch_max(done, Ordering::SeqCst);
                assert!(done <= total);
            }))
            .unwrap();

        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_indexed, 2);
        assert_eq!(report.files_failed, 0);
        assert!(report.chunks_created >= 3);
        assert_eq!(report.embeddings_stored, engine.store().chunk_count());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(engine.graph().node_count() >= 3);
    }

    #[test]
    fn reindex_replaces_a_files_chunks_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "m.py", "def one():\n    return 1\n");
        let (_provider, engine) = engine_for(tmp.path());
        engine.index_workspace(None).unwrap();
        let before = engine.store().chunks_for_file("m.py");
        assert_eq!(before.len(), 1);

        std::fs::write(&path, "def one():\n    return 1\n\ndef two():\n    return 2\n").unwrap();
        engine.reindex_file(&path).unwrap();

        let after = engine.store().chunks_for_file("m.py");
        assert_eq!(after.len(), 2);
        let symbols: Vec<&str> = after
            .iter()
            .filter_map(|c| c.symbol_name.as_deref())
            .collect();
        assert_eq!(symbols, vec!["one", "two"]);
    }

    #[test]
    fn reindexing_unchanged_content_reproduces_the_same_chunk_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "m.py", "def one():\n    return 1\n");
        let (_provider, engine) = engine_for(tmp.path());
        engine.index_workspace(None).unwrap();

        let ids_before: Vec<String> = engine
            .store()
            .chunks_for_file("m.py")
            .into_iter()
            .map(|c| c.id)
            .collect();

        engine.reindex_file(&path).unwrap();
        let ids_after: Vec<String> = engine
            .store()
            .chunks_for_file("m.py")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids_before, ids_after);
    }

    #[test]
    fn deleting_a_file_drops_its_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "m.py", "def one():\n    return 1\n");
        let (_provider, engine) = engine_for(tmp.path());
        engine.index_workspace(None).unwrap();
        assert!(!engine.store().is_empty());

        std::fs::remove_file(&path).unwrap();
        engine.reindex_file(&path).unwrap();
        assert!(engine.store().is_empty());
    }

    #[test]
    fn embedding_failure_keeps_the_previous_chunk_set() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "m.py", "def one():\n    return 1\n");
        let (provider, engine) = engine_for(tmp.path());
        engine.index_workspace(None).unwrap();
        let before = engine.store().chunks_for_file("m.py");

        std::fs::write(&path, "def changed():\n    return 9\n").unwrap();
        provider.fail_first.store(5, Ordering::SeqCst);
        assert!(engine.reindex_file(&path).is_err());

        // Old chunks survive an embedding outage.
        assert_eq!(engine.store().chunks_for_file("m.py"), before);
    }

    #[test]
    fn per_file_failures_do_not_abort_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "good.py", "def ok():\n    return 1\n");
        write(tmp.path(), "doomed.py", "def cursed_symbol():\n    return 1\n");

        let (provider, engine) = engine_for(tmp.path());
        provider
            .fail_substring
            .lock()
            .unwrap()
            .replace("cursed_symbol".to_string());

        let report = engine.index_workspace(None).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.files_failed, 1);
        assert_eq!(engine.store().file_count(), 1);
        assert!(engine.store().chunks_for_file("doomed.py").is_empty());
    }
}
