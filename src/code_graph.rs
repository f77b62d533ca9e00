//! Symbol table plus call/import/inherit/contains edges, built from
//! syntactic analysis only.
//!
//! Two-pass build: pass 1 collects every file's symbols and imports,
//! pass 2 resolves call sites to bare callee names and records edges.
//! The graph is immutable once built; the owner swaps whole instances
//! behind a lock so readers keep the previous version during a rebuild.

use std::collections::HashMap;

use crate::error::CoreResult;
use crate::lang::{self, SymbolKind};
use crate::scanner::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Calls,
    Imports,
    Inherits,
    Contains,
}

/// Default edge kinds consulted by the retriever's graph expansion.
pub const DEFAULT_RELATED_KINDS: &[EdgeKind] = &[EdgeKind::Calls, EdgeKind::Inherits];

#[derive(Debug, Clone)]
pub struct SymbolNode {
    pub name: String,
    pub file_path: String,
    pub kind: SymbolKind,
    pub line_start: u32,
    pub line_end: u32,
    pub parent: Option<String>,
}

impl SymbolNode {
    /// Node id: `file::name`.
    pub fn id(&self) -> String {
        format!("{}::{}", self.file_path, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    /// Node id for resolved sources, bare name otherwise.
    pub source: String,
    /// Bare symbol name (calls/inherits) or module path (imports).
    pub target: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Default)]
pub struct CodeGraph {
    nodes: HashMap<String, SymbolNode>,
    edges: Vec<GraphEdge>,
    /// file → imported module texts.
    imports: HashMap<String, Vec<String>>,
}

impl CodeGraph {
    /// Build the graph for a set of scanned files. Files whose language
    /// has no driver are skipped; per-file parse failures are logged and
    /// do not abort the build.
    pub fn build(files: &[FileEntry]) -> CoreResult<Self> {
        let mut graph = Self::default();

        // Pass 1: symbols and imports.
        let mut outlines: Vec<(String, lang::SourceOutline)> = Vec::new();
        for entry in files {
            if !entry.language.has_driver() {
                continue;
            }
            let source = match std::fs::read_to_string(&entry.abs_path) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(file = %entry.rel_key(), %err, "unreadable during graph build");
                    continue;
                }
            };
            let rel = entry.rel_key();
            match lang::outline(entry.language, &rel, &source) {
                Ok(outline) => {
                    graph.add_file_symbols(&rel, &outline);
                    outlines.push((rel, outline));
                }
                Err(err) => {
                    tracing::debug!(file = %rel, %err, "graph build skipped unparseable file");
                }
            }
        }

        // Pass 2: relationships.
        for (rel, outline) in &outlines {
            graph.add_file_relationships(rel, outline);
        }

        Ok(graph)
    }

    fn add_file_symbols(&mut self, rel: &str, outline: &lang::SourceOutline) {
        for sym in &outline.symbols {
            let node = SymbolNode {
                name: sym.name.clone(),
                file_path: rel.to_string(),
                kind: sym.kind,
                line_start: sym.start_line,
                line_end: sym.end_line,
                parent: sym.parent.clone(),
            };
            self.nodes.insert(node.id(), node);
        }
        if !outline.imports.is_empty() {
            self.imports.insert(rel.to_string(), outline.imports.clone());
        }
    }

    fn add_file_relationships(&mut self, rel: &str, outline: &lang::SourceOutline) {
        for call in &outline.calls {
            let Some(caller) = &call.caller else { continue };
            self.edges.push(GraphEdge {
                source: format!("{rel}::{caller}"),
                target: call.callee.clone(),
                kind: EdgeKind::Calls,
            });
        }
        for (class, base) in &outline.inherits {
            self.edges.push(GraphEdge {
                source: format!("{rel}::{class}"),
                target: base.clone(),
                kind: EdgeKind::Inherits,
            });
        }
        for sym in &outline.symbols {
            if let Some(parent) = &sym.parent {
                self.edges.push(GraphEdge {
                    source: format!("{rel}::{parent}"),
                    target: sym.name.clone(),
                    kind: EdgeKind::Contains,
                });
            }
        }
        for module in outline.imports.iter() {
            self.edges.push(GraphEdge {
                source: rel.to_string(),
                target: module.clone(),
                kind: EdgeKind::Imports,
            });
        }
    }

    fn node_by_name(&self, name: &str) -> Option<&SymbolNode> {
        self.nodes.values().find(|n| n.name == name)
    }

    /// Symbols one hop away from `name` over the requested edge kinds.
    /// An edge endpoint counts whether `name` is its source symbol or its
    /// target, mirroring callers-and-callees traversal.
    pub fn related_symbols(&self, name: &str, kinds: &[EdgeKind]) -> Vec<&SymbolNode> {
        if self.node_by_name(name).is_none() {
            return vec![];
        }

        let suffix = format!("::{name}");
        let mut related: Vec<&SymbolNode> = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for edge in &self.edges {
            if !kinds.contains(&edge.kind) {
                continue;
            }
            let source_name = edge.source.rsplit("::").next().unwrap_or(&edge.source);
            let other = if source_name == name || edge.source.ends_with(&suffix) {
                edge.target.as_str()
            } else if edge.target == name {
                source_name
            } else {
                continue;
            };
            if other == name {
                continue;
            }
            if let Some(node) = self.node_by_name(other) {
                let id = node.id();
                if !seen.contains(&id) {
                    seen.push(id);
                    related.push(node);
                }
            }
        }
        related
    }

    pub fn imports_of(&self, file_path: &str) -> &[String] {
        self.imports.get(file_path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node(&self, id: &str) -> Option<&SymbolNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
