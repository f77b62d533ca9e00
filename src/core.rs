//! Explicit wiring of the pipeline: one `Core` handle created at
//! startup and passed by reference. Components that need siblings
//! receive them at construction; there is no global registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::DiskCache;
use crate::chunker::Chunker;
use crate::config::Config;
use crate::context::{AssembledContext, ContextAssembler};
use crate::diff::DiffEngine;
use crate::embedder::{Embedder, EmbeddingProvider};
use crate::error::{CoreError, CoreResult};
use crate::facts::FactsStore;
use crate::incremental::IncrementalIndexer;
use crate::indexer::IndexEngine;
use crate::llm::{ChatProvider, Message};
use crate::retriever::{RankedChunk, RetrieveOptions, Retriever};
use crate::scanner::ScanOptions;
use crate::summarizer::Summarizer;
use crate::token_counter::TokenCounter;
use crate::vector_store::VectorStore;
use crate::watcher::WorkspaceWatcher;

pub struct Core {
    pub workspace_root: PathBuf,
    pub config: Config,
    pub engine: Arc<IndexEngine>,
    pub token_counter: TokenCounter,
    pub summarizer: Summarizer,
    pub facts: Option<FactsStore>,
    pub diff: DiffEngine,
}

/// A running watch session; dropping it stops both the watcher and the
/// background indexer.
pub struct WatchSession {
    pub indexer: IncrementalIndexer,
    _watcher: WorkspaceWatcher,
}

impl Core {
    /// Wire up every component under `workspace_root`. The embedding
    /// provider is required; the chat provider (summaries) is optional
    /// and its absence degrades gracefully.
    pub fn open(
        workspace_root: &Path,
        config: Config,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        chat_provider: Option<(Arc<dyn ChatProvider>, String)>,
    ) -> CoreResult<Self> {
        let workspace_root = workspace_root
            .canonicalize()
            .map_err(|e| CoreError::NotFound(format!("workspace root: {e}")))?;
        let state_dir = workspace_root.join(&config.state_dir);

        let query_cache = if config.enable_cache {
            Some(
                DiskCache::open(
                    state_dir.join("embedding_cache"),
                    Duration::from_secs(config.cache_ttl_seconds),
                )
                .map_err(|e| CoreError::Internal(format!("embedding cache: {e}")))?,
            )
        } else {
            None
        };

        let store = Arc::new(VectorStore::open(
            &state_dir,
            embedding_provider.model_id(),
            config.chunk_size,
        )?);
        let embedder = Embedder::new(embedding_provider, query_cache);
        let engine = Arc::new(IndexEngine::new(
            &workspace_root,
            ScanOptions::from_config(&workspace_root, &config),
            Chunker::new(config.chunk_size, config.chunk_overlap),
            embedder,
            store,
        ));

        let facts = if config.enable_memory_db {
            Some(FactsStore::open(&state_dir.join("memory.db"))?)
        } else {
            None
        };

        let summarizer = match chat_provider {
            Some((provider, model)) => Summarizer::new(Some(provider), model),
            None => Summarizer::disabled(),
        };

        Ok(Self {
            diff: DiffEngine::new(&workspace_root),
            token_counter: TokenCounter::new(),
            summarizer,
            facts,
            engine,
            config,
            workspace_root,
        })
    }

    /// Retrieve relevant chunks; honors `enable_rag`.
    pub fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> CoreResult<Vec<RankedChunk>> {
        if !self.config.enable_rag {
            return Ok(vec![]);
        }
        let graph = self.engine.graph();
        let retriever = Retriever::new(
            self.engine.store(),
            opts.graph.then_some(&*graph),
            self.engine.embedder(),
        );
        retriever.retrieve(query, opts)
    }

    /// Assemble a budgeted message list for one LLM call.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        &self,
        user_message: &str,
        history: &[Message],
        rag_context: &str,
        system_prompt: &str,
        model: &str,
        session_id: Option<&str>,
    ) -> AssembledContext {
        let assembler = ContextAssembler::new(
            &self.token_counter,
            &self.summarizer,
            self.facts.as_ref(),
            &self.config,
        );
        assembler.assemble(
            user_message,
            history,
            rag_context,
            system_prompt,
            model,
            session_id,
        )
    }

    /// Start the incremental pipeline: watcher → debounce → reindex.
    pub fn watch(&self) -> CoreResult<WatchSession> {
        let indexer = IncrementalIndexer::start(Arc::clone(&self.engine))?;
        let watcher = WorkspaceWatcher::start(&self.workspace_root, indexer.sender())?;
        Ok(WatchSession {
            indexer,
            _watcher: watcher,
        })
    }
}
