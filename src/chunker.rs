//! Language-aware splitting of source files into retrieval units.
//!
//! The AST path emits one chunk per top-level class and per
//! function/method plus a single imports chunk; parse failure falls back
//! to sliding line windows. Oversized chunks are sub-split so every
//! stored chunk fits the embedding model's input budget.

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::lang::{self, Language, SymbolKind};
use crate::scanner::FileEntry;

/// Conservative per-input budget for an 8,192-token embedding model.
pub const EMBED_TOKEN_BUDGET: usize = 8_000;

/// Cheap token estimate used for the embedding budget: ~4 chars/token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Floor on sub-chunk size when splitting an oversized chunk.
const MIN_SPLIT_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Imports,
    Class,
    Function,
    Method,
    Block,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imports => "imports",
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic unit of retrieval. `content` is the exact slice of the file
/// at `start_line..=end_line` (1-based inclusive) at chunking time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub language: Language,
    pub chunk_type: ChunkType,
    pub start_line: u32,
    pub end_line: u32,
    pub symbol_name: Option<String>,
    pub parent_symbol: Option<String>,
    pub content: String,
}

/// Stable chunk id: xxh3 of the identifying tuple. Identical file content
/// yields identical ids across runs.
pub fn chunk_id(file_path: &str, start_line: u32, end_line: u32, symbol_name: Option<&str>) -> String {
    let key = format!(
        "{file_path}:{start_line}:{end_line}:{}",
        symbol_name.unwrap_or("")
    );
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(key.as_bytes()))
}

pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// The text actually sent to the embedding provider: a symbol header when
/// present, the file path, then the verbatim content.
pub fn format_for_embedding(chunk: &Chunk) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(4);
    if let Some(symbol) = &chunk.symbol_name {
        parts.push(format!("{}: {symbol}", chunk.chunk_type));
        if let Some(parent) = &chunk.parent_symbol {
            parts.push(format!("in {parent}"));
        }
    }
    parts.push(format!("file: {}", chunk.file_path));
    parts.push(chunk.content.clone());
    parts.join("\n")
}

#[derive(Debug, Clone)]
pub struct Chunker {
    /// Lines per window on the fallback path.
    pub chunk_size: usize,
    /// Overlap lines between consecutive fallback windows.
    pub chunk_overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Chunk a scanned file from disk. Empty files yield zero chunks.
    pub fn chunk_file(&self, entry: &FileEntry) -> CoreResult<Vec<Chunk>> {
        let raw = std::fs::read(&entry.abs_path)?;
        if raw.contains(&0u8) {
            return Ok(vec![]); // binary, skip
        }
        let content = String::from_utf8_lossy(&raw).into_owned();
        Ok(self.chunk_source(&entry.rel_key(), entry.language, &content))
    }

    /// Chunk in-memory source. Deterministic: identical input produces
    /// identical chunk ids, bounds, and ordering.
    pub fn chunk_source(&self, rel_path: &str, language: Language, content: &str) -> Vec<Chunk> {
        if content.trim().is_empty() {
            return vec![];
        }

        let chunks = if language.has_driver() {
            match self.semantic_chunks(rel_path, language, content) {
                Some(chunks) if !chunks.is_empty() => chunks,
                _ => self.line_window_chunks(rel_path, language, content),
            }
        } else {
            self.line_window_chunks(rel_path, language, content)
        };

        chunks.into_iter().flat_map(split_oversize).collect()
    }

    fn semantic_chunks(
        &self,
        rel_path: &str,
        language: Language,
        content: &str,
    ) -> Option<Vec<Chunk>> {
        let outline = match lang::outline(language, rel_path, content) {
            Ok(outline) => outline,
            Err(err) => {
                tracing::debug!(file = rel_path, %err, "AST chunking failed, using line windows");
                return None;
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len() as u32;
        let mut chunks: Vec<Chunk> = Vec::new();

        // One chunk spanning every import statement.
        if let (Some(&first), Some(&last)) =
            (outline.import_lines.first(), outline.import_lines.last())
        {
            chunks.push(make_chunk(
                rel_path,
                language,
                ChunkType::Imports,
                first,
                last.min(total),
                None,
                None,
                &lines,
            ));
        }

        for sym in &outline.symbols {
            let chunk_type = match sym.kind {
                SymbolKind::Class => ChunkType::Class,
                SymbolKind::Function => ChunkType::Function,
                SymbolKind::Method => ChunkType::Method,
            };
            chunks.push(make_chunk(
                rel_path,
                language,
                chunk_type,
                sym.start_line,
                sym.end_line.min(total),
                Some(sym.name.clone()),
                sym.parent.clone(),
                &lines,
            ));
        }

        Some(chunks)
    }

    /// Sliding window of `chunk_size` lines with `chunk_overlap` lines of
    /// overlap. Blank windows are dropped.
    fn line_window_chunks(&self, rel_path: &str, language: Language, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        let step = self.chunk_size.saturating_sub(self.chunk_overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < lines.len() {
            let end = (start + self.chunk_size).min(lines.len());
            let body = lines[start..end].join("\n");
            if !body.trim().is_empty() {
                chunks.push(make_chunk(
                    rel_path,
                    language,
                    ChunkType::Block,
                    start as u32 + 1,
                    end as u32,
                    None,
                    None,
                    &lines,
                ));
            }
            if end == lines.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    rel_path: &str,
    language: Language,
    chunk_type: ChunkType,
    start_line: u32,
    end_line: u32,
    symbol_name: Option<String>,
    parent_symbol: Option<String>,
    lines: &[&str],
) -> Chunk {
    let start = start_line.max(1);
    let end = end_line.max(start);
    let content = lines[(start as usize - 1)..(end as usize).min(lines.len())].join("\n");
    Chunk {
        id: chunk_id(rel_path, start, end, symbol_name.as_deref()),
        file_path: rel_path.to_string(),
        language,
        chunk_type,
        start_line: start,
        end_line: end,
        symbol_name,
        parent_symbol,
        content,
    }
}

/// Split a chunk whose formatted embedding text exceeds the per-input
/// budget into contiguous line-range sub-chunks. Only the first sub-chunk
/// retains `symbol_name`; `parent_symbol`, `chunk_type`, and `language`
/// carry through. Recurses until every piece fits or no further progress
/// is possible.
fn split_oversize(chunk: Chunk) -> Vec<Chunk> {
    let estimated = estimate_tokens(&format_for_embedding(&chunk));
    if estimated <= EMBED_TOKEN_BUDGET {
        return vec![chunk];
    }

    let lines: Vec<&str> = chunk.content.split('\n').collect();
    let pieces = estimated / EMBED_TOKEN_BUDGET + 1;
    let per_chunk = (lines.len() / pieces).max(MIN_SPLIT_LINES);
    if per_chunk >= lines.len() {
        // Cannot make progress (a handful of pathologically long lines);
        // keep the chunk rather than loop forever.
        return vec![chunk];
    }

    let mut out: Vec<Chunk> = Vec::new();
    let mut offset = 0usize;
    while offset < lines.len() {
        let take = per_chunk.min(lines.len() - offset);
        let start_line = chunk.start_line + offset as u32;
        let end_line = start_line + take as u32 - 1;
        let symbol_name = if offset == 0 { chunk.symbol_name.clone() } else { None };
        let sub = Chunk {
            id: chunk_id(&chunk.file_path, start_line, end_line, symbol_name.as_deref()),
            file_path: chunk.file_path.clone(),
            language: chunk.language,
            chunk_type: chunk.chunk_type,
            start_line,
            end_line,
            symbol_name,
            parent_symbol: chunk.parent_symbol.clone(),
            content: lines[offset..offset + take].join("\n"),
        };
        out.extend(split_oversize(sub));
        offset += take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_FILE: &str = r#"import os
from pathlib import Path

class Store:
    def save(self, key):
        return write_entry(key)

def write_entry(key):
    return os.path.join("db", key)
"#;

    fn chunker() -> Chunker {
        Chunker::new(40, 5)
    }

    #[test]
    fn python_file_yields_imports_class_and_function_chunks() {
        let chunks = chunker().chunk_source("store.py", Language::Python, PY_FILE);

        let imports = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Imports)
            .unwrap();
        assert_eq!((imports.start_line, imports.end_line), (1, 2));
        assert_eq!(imports.content, "import os\nfrom pathlib import Path");

        let class = chunks.iter().find(|c| c.chunk_type == ChunkType::Class).unwrap();
        assert_eq!(class.symbol_name.as_deref(), Some("Store"));

        let method = chunks.iter().find(|c| c.chunk_type == ChunkType::Method).unwrap();
        assert_eq!(method.symbol_name.as_deref(), Some("save"));
        assert_eq!(method.parent_symbol.as_deref(), Some("Store"));

        let function = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Function)
            .unwrap();
        assert_eq!(function.symbol_name.as_deref(), Some("write_entry"));
        assert!(function.parent_symbol.is_none());
    }

    #[test]
    fn chunking_is_deterministic() {
        let a = chunker().chunk_source("store.py", Language::Python, PY_FILE);
        let b = chunker().chunk_source("store.py", Language::Python, PY_FILE);
        assert_eq!(a, b);
        let ids: Vec<&str> = a.iter().map(|c| c.id.as_str()).collect();
        let ids_again: Vec<&str> = b.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ids_again);
    }

    #[test]
    fn content_is_exact_line_slice() {
        let chunks = chunker().chunk_source("store.py", Language::Python, PY_FILE);
        let all_lines: Vec<&str> = PY_FILE.lines().collect();
        for c in &chunks {
            let expected =
                all_lines[(c.start_line as usize - 1)..(c.end_line as usize)].join("\n");
            assert_eq!(c.content, expected, "chunk {} content drifted", c.id);
            assert!(c.start_line <= c.end_line);
        }
    }

    #[test]
    fn empty_file_yields_zero_chunks() {
        assert!(chunker().chunk_source("a.py", Language::Python, "").is_empty());
        assert!(chunker()
            .chunk_source("a.py", Language::Python, "   \n\n  ")
            .is_empty());
    }

    #[test]
    fn unparseable_python_falls_back_to_line_windows() {
        // The grammar recovers from many errors, so force the fallback by
        // chunking an unsupported language instead.
        let body = (0..100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let chunks = chunker().chunk_source("a.rb", Language::Ruby, &body);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Block));
        // 40-line windows with 5-line overlap: starts at 1, 36, 71.
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[1].start_line, 36);
        assert_eq!(chunks[2].start_line, 71);
    }

    #[test]
    fn window_overlap_repeats_boundary_lines() {
        let body = (1..=80).map(|i| format!("l{i}")).collect::<Vec<_>>().join("\n");
        let chunks = chunker().chunk_source("x.rb", Language::Ruby, &body);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].content.ends_with("l40"));
        assert!(chunks[1].content.starts_with("l36"));
        assert!(chunks[2].content.starts_with("l71"));
    }

    #[test]
    fn oversize_function_splits_into_budgeted_sub_chunks() {
        // One 4,000-line function, ~40 chars per line ≈ 40k estimated
        // tokens against an 8k budget.
        let mut body = String::from("def huge():\n");
        for i in 0..3_999 {
            body.push_str(&format!("    value_{i:05} = \"{:028}\"\n", i));
        }
        let chunks = chunker().chunk_source("huge.py", Language::Python, &body);
        let subs: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Function)
            .collect();

        assert!(subs.len() >= 5, "expected >=5 sub-chunks, got {}", subs.len());
        for c in &subs {
            assert!(
                estimate_tokens(&format_for_embedding(c)) <= EMBED_TOKEN_BUDGET,
                "sub-chunk {} exceeds the embedding budget",
                c.id
            );
            assert!(c.parent_symbol.is_none());
        }
        // Symbol metadata on the first sub-chunk only.
        assert_eq!(subs[0].symbol_name.as_deref(), Some("huge"));
        assert!(subs[1..].iter().all(|c| c.symbol_name.is_none()));

        // Re-joining content in order reproduces the original text.
        let rejoined: Vec<String> = subs.iter().map(|c| c.content.clone()).collect();
        let original: Vec<&str> = body.lines().collect();
        assert_eq!(rejoined.join("\n"), original.join("\n"));
    }

    #[test]
    fn chunk_ids_are_stable_hashes_of_identity() {
        let a = chunk_id("a.py", 1, 10, Some("f"));
        let b = chunk_id("a.py", 1, 10, Some("f"));
        let c = chunk_id("a.py", 1, 11, Some("f"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
