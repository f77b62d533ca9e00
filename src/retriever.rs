//! Hybrid retrieval: semantic candidates, keyword boost, code-graph
//! expansion, and a multi-signal re-rank.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::code_graph::{CodeGraph, DEFAULT_RELATED_KINDS};
use crate::embedder::Embedder;
use crate::error::CoreResult;
use crate::vector_store::{ChunkFilter, Scored, VectorStore};

/// Distance reduction per query keyword found in a candidate. Empirical;
/// tune alongside the re-rank weights.
pub const KEYWORD_BOOST: f32 = 0.1;

/// Re-rank composite weights: semantic, symbol overlap, content overlap,
/// file-path hit.
const W_SEMANTIC: f32 = 0.4;
const W_SYMBOL: f32 = 0.3;
const W_CONTENT: f32 = 0.2;
const W_PATH: f32 = 0.1;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did",
    "will", "would", "should", "could", "may", "might", "must", "can",
];

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub file_filter: Option<String>,
    pub hybrid: bool,
    pub graph: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            file_filter: None,
            hybrid: true,
            graph: true,
        }
    }
}

/// One retrieval hit with its scoring trail.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: crate::chunker::Chunk,
    pub distance: f32,
    pub rerank_score: f32,
}

pub struct Retriever<'a> {
    store: &'a VectorStore,
    graph: Option<&'a CodeGraph>,
    embedder: &'a Embedder,
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("static regex"))
}

fn words(text: &str) -> HashSet<String> {
    word_re()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn query_keywords(query: &str) -> HashSet<String> {
    let mut keywords = words(query);
    for stop in STOP_WORDS {
        keywords.remove(*stop);
    }
    keywords
}

fn overlap_fraction(query_words: &HashSet<String>, other: &HashSet<String>) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let hits = query_words.intersection(other).count();
    hits as f32 / query_words.len() as f32
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a VectorStore, graph: Option<&'a CodeGraph>, embedder: &'a Embedder) -> Self {
        Self {
            store,
            graph,
            embedder,
        }
    }

    /// Retrieve the `top_k` most relevant chunks for `query`.
    ///
    /// With hybrid or graph stages enabled the final ordering is the
    /// re-rank composite (non-increasing); plain semantic retrieval
    /// returns cosine-distance order untouched.
    pub fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> CoreResult<Vec<RankedChunk>> {
        if self.store.is_empty() || opts.top_k == 0 {
            return Ok(vec![]);
        }

        let filter = opts.file_filter.as_ref().map(|p| ChunkFilter::for_file(p.clone()));
        let mut candidates = self.semantic(query, opts.top_k * 2, filter.as_ref())?;

        if opts.hybrid {
            candidates = hybrid_order(query, candidates, opts.top_k * 2);
        }

        if opts.graph {
            if let Some(graph) = self.graph {
                self.expand_with_graph(graph, &mut candidates, opts.top_k)?;
            }
        }

        if opts.hybrid || opts.graph {
            Ok(rerank(query, candidates, opts.top_k))
        } else {
            candidates.truncate(opts.top_k);
            Ok(candidates
                .into_iter()
                .map(|s| RankedChunk {
                    rerank_score: 1.0 - s.distance.clamp(0.0, 1.0),
                    distance: s.distance,
                    chunk: s.chunk,
                })
                .collect())
        }
    }

    fn semantic(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> CoreResult<Vec<Scored>> {
        let query_vector = self.embedder.embed_query(query)?;
        Ok(self.store.query(&query_vector, k, filter))
    }

    /// For the strongest candidates that carry a symbol name, pull in one
    /// focused hit per related symbol (up to two relations each).
    fn expand_with_graph(
        &self,
        graph: &CodeGraph,
        candidates: &mut Vec<Scored>,
        top_k: usize,
    ) -> CoreResult<()> {
        let mut seen: HashSet<String> = candidates.iter().map(|s| s.chunk.id.clone()).collect();
        let mut additions: Vec<Scored> = Vec::new();

        for candidate in candidates.iter().take((top_k / 2).max(1)) {
            let Some(symbol) = &candidate.chunk.symbol_name else {
                continue;
            };
            for related in graph
                .related_symbols(symbol, DEFAULT_RELATED_KINDS)
                .into_iter()
                .take(2)
            {
                let filter = ChunkFilter::for_file(related.file_path.clone());
                let hits = match self.semantic(&related.name, 1, Some(&filter)) {
                    Ok(hits) => hits,
                    Err(err) => {
                        tracing::debug!(symbol = %related.name, %err, "graph expansion lookup failed");
                        continue;
                    }
                };
                for hit in hits {
                    if seen.insert(hit.chunk.id.clone()) {
                        additions.push(hit);
                    }
                }
            }
        }

        candidates.extend(additions);
        Ok(())
    }
}

/// Hybrid stage: reduce each candidate's distance by [`KEYWORD_BOOST`]
/// per query keyword appearing in its content or symbol name, then
/// re-sort ascending and keep the strongest `limit`.
fn hybrid_order(query: &str, candidates: Vec<Scored>, limit: usize) -> Vec<Scored> {
    let keywords = query_keywords(query);
    if keywords.is_empty() {
        return candidates;
    }

    let mut scored: Vec<(f32, Scored)> = candidates
        .into_iter()
        .map(|candidate| {
            let content = candidate.chunk.content.to_lowercase();
            let symbol = candidate
                .chunk
                .symbol_name
                .as_deref()
                .unwrap_or("")
                .to_lowercase();
            let hits = keywords
                .iter()
                .filter(|kw| content.contains(kw.as_str()) || symbol.contains(kw.as_str()))
                .count();
            let score = candidate.distance * (1.0 - hits as f32 * KEYWORD_BOOST);
            (score, candidate)
        })
        .collect();

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, c)| c).collect()
}

/// Final composite ordering. Stable sort, so equal scores keep insertion
/// order.
fn rerank(query: &str, candidates: Vec<Scored>, top_k: usize) -> Vec<RankedChunk> {
    let query_words = words(query);

    let mut ranked: Vec<RankedChunk> = candidates
        .into_iter()
        .map(|candidate| {
            let mut score = W_SEMANTIC * (1.0 - candidate.distance.clamp(0.0, 1.0));

            if let Some(symbol) = &candidate.chunk.symbol_name {
                score += W_SYMBOL * overlap_fraction(&query_words, &words(symbol));
            }
            score += W_CONTENT * overlap_fraction(&query_words, &words(&candidate.chunk.content));

            let path = candidate.chunk.file_path.to_lowercase();
            if query_words.iter().any(|w| path.contains(w.as_str())) {
                score += W_PATH;
            }

            RankedChunk {
                rerank_score: score,
                distance: candidate.distance,
                chunk: candidate.chunk,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_k);
    ranked
}

/// Render retrieval hits as a prompt-ready context block.
pub fn format_context(chunks: &[RankedChunk]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(chunks.len());
    for ranked in chunks {
        let c = &ranked.chunk;
        let mut symbol_info = String::new();
        if let Some(symbol) = &c.symbol_name {
            symbol_info = format!(" ({}: {symbol})", c.chunk_type);
            if let Some(parent) = &c.parent_symbol {
                symbol_info.push_str(&format!(" in {parent}"));
            }
        }
        parts.push(format!(
            "<file: {}, lines {}-{}{symbol_info}>\n{}\n",
            c.file_path, c.start_line, c.end_line, c.content
        ));
    }
    parts.join("\n")
}
