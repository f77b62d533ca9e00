//! Debounced incremental indexing.
//!
//! A background worker owns a `pending` map of paths awaiting reindex.
//! Every event re-arms that path's deadline (sliding debounce), multiple
//! events for one path coalesce to the latest action, and the worker
//! wakes at most every tick to process entries whose deadline passed.
//! Reindexing runs against the engine's per-file guard, so events for a
//! single file are processed in arrival order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};
use crate::indexer::IndexEngine;

/// Quiescent period after the last event before a path is reindexed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Maximum worker wake-up interval.
pub const WORKER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMessage {
    Reindex(PathBuf),
    Remove(PathBuf),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Reindex,
    Remove,
}

pub struct IncrementalIndexer {
    tx: Sender<IndexMessage>,
    handle: Option<JoinHandle<()>>,
}

impl IncrementalIndexer {
    /// Spawn the worker loop over `engine`.
    pub fn start(engine: Arc<IndexEngine>) -> CoreResult<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("incremental-indexer".to_string())
            .spawn(move || worker_loop(engine, rx))
            .map_err(|e| CoreError::Internal(format!("worker spawn: {e}")))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Sender half for the watcher (or anyone else) to push events into.
    pub fn sender(&self) -> Sender<IndexMessage> {
        self.tx.clone()
    }

    /// Stop the worker, processing nothing further.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(IndexMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IncrementalIndexer {
    fn drop(&mut self) {
        let _ = self.tx.send(IndexMessage::Shutdown);
    }
}

fn stage(pending: &mut HashMap<PathBuf, (PendingAction, Instant)>, msg: IndexMessage) {
    let (path, action) = match msg {
        IndexMessage::Reindex(p) => (p, PendingAction::Reindex),
        IndexMessage::Remove(p) => (p, PendingAction::Remove),
        IndexMessage::Shutdown => return,
    };
    // Latest action wins; the deadline slides on every event.
    pending.insert(path, (action, Instant::now() + DEBOUNCE_WINDOW));
}

fn worker_loop(engine: Arc<IndexEngine>, rx: Receiver<IndexMessage>) {
    let mut pending: HashMap<PathBuf, (PendingAction, Instant)> = HashMap::new();

    loop {
        // Block up to one tick for the next event, then drain the rest.
        match rx.recv_timeout(WORKER_TICK) {
            Ok(IndexMessage::Shutdown) => return,
            Ok(msg) => stage(&mut pending, msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        loop {
            match rx.try_recv() {
                Ok(IndexMessage::Shutdown) => return,
                Ok(msg) => stage(&mut pending, msg),
                Err(_) => break,
            }
        }

        // Process everything whose debounce window has elapsed.
        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let Some((action, _)) = pending.remove(&path) else { continue };
            let result = match action {
                PendingAction::Reindex => engine.reindex_file(&path),
                PendingAction::Remove => engine.remove_file(&path),
            };
            match result {
                Ok(n) => {
                    tracing::debug!(path = %path.display(), chunks = n, "incremental update")
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "incremental update failed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::embedder::test_support::FakeEmbeddingProvider;
    use crate::embedder::Embedder;
    use crate::retry::RetryPolicy;
    use crate::scanner::ScanOptions;
    use crate::vector_store::VectorStore;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn engine_for(root: &Path) -> (Arc<FakeEmbeddingProvider>, Arc<IndexEngine>) {
        let provider = Arc::new(FakeEmbeddingProvider::new(8));
        let embedder = Embedder::new(provider.clone(), None)
            .with_retry_policy(RetryPolicy::immediate(1));
        let store = Arc::new(
            VectorStore::open(&root.join(".codegrounds"), "fake-embedder", 40).unwrap(),
        );
        let engine = Arc::new(IndexEngine::new(
            root,
            ScanOptions::new(root),
            Chunker::new(40, 5),
            embedder,
            store,
        ));
        (provider, engine)
    }

    #[test]
    fn rapid_edits_coalesce_into_one_reindex() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.py");

        let (provider, engine) = engine_for(tmp.path());
        let indexer = IncrementalIndexer::start(engine.clone()).unwrap();
        let tx = indexer.sender();

        // Three modifications within 1.5 s.
        for body in ["def v1():\n    pass\n", "def v2():\n    pass\n", "def v3():\n    pass\n"] {
            std::fs::write(&path, body).unwrap();
            tx.send(IndexMessage::Reindex(path.clone())).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        }

        // Wait out the debounce window plus a tick.
        std::thread::sleep(Duration::from_secs(3));

        // Exactly one reindex (one embedding request), final content only.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let chunks = engine.store().chunks_for_file("f.py");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].symbol_name.as_deref(), Some("v3"));

        indexer.shutdown();
    }

    #[test]
    fn delete_event_removes_the_files_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.py");
        std::fs::write(&path, "def f():\n    pass\n").unwrap();

        let (_provider, engine) = engine_for(tmp.path());
        engine.index_workspace(None).unwrap();
        assert!(!engine.store().is_empty());

        let indexer = IncrementalIndexer::start(engine.clone()).unwrap();
        std::fs::remove_file(&path).unwrap();
        indexer.sender().send(IndexMessage::Remove(path)).unwrap();

        std::thread::sleep(Duration::from_secs(3));
        assert!(engine.store().is_empty());

        indexer.shutdown();
    }

    #[test]
    fn latest_action_wins_for_a_path() {
        let mut pending = HashMap::new();
        let p = PathBuf::from("/w/f.py");
        stage(&mut pending, IndexMessage::Reindex(p.clone()));
        stage(&mut pending, IndexMessage::Remove(p.clone()));
        assert_eq!(pending.get(&p).map(|(a, _)| *a), Some(PendingAction::Remove));

        stage(&mut pending, IndexMessage::Reindex(p.clone()));
        assert_eq!(pending.get(&p).map(|(a, _)| *a), Some(PendingAction::Reindex));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn shutdown_stops_the_worker_promptly() {
        let tmp = tempfile::tempdir().unwrap();
        let (_provider, engine) = engine_for(tmp.path());
        let indexer = IncrementalIndexer::start(engine).unwrap();
        let started = Instant::now();
        indexer.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
