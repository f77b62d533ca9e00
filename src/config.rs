use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard safety ceiling: files larger than this are **always** skipped,
/// regardless of config. Protects low-RAM machines from parsing a
/// multi-megabyte minified bundle.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000; // 1 MB

/// Controls workspace scanning behavior (what to skip).
///
/// Note: `.gitignore` is always respected by the scanner; these are
/// additional hard skips for noisy monorepo directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory *names* to skip anywhere in the tree (e.g. "generated").
    /// Compared against path components, not full paths.
    pub exclude_dir_names: Vec<String>,
    /// Per-file byte cap; clamped to [`ABSOLUTE_MAX_FILE_BYTES`].
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_dir_names: vec![],
            // 512 KB default: enough for any real source file, blocks
            // log/generated bloat.
            max_file_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workspace-local state directory: vector index, memory DB,
    /// embedding cache.
    pub state_dir: String,
    /// Settings that govern file discovery and exclusion.
    pub scan: ScanConfig,
    /// Lines per chunk on the fallback (non-AST) chunking path.
    pub chunk_size: usize,
    /// Overlap lines between consecutive fallback chunks.
    pub chunk_overlap: usize,
    /// Default number of chunks returned by a retrieval.
    pub top_k_retrieval: usize,
    /// Context budget for small-window models.
    pub max_context_tokens: usize,
    /// Context budget for large-window models.
    pub max_context_tokens_large: usize,
    /// Fraction of the budget at which history summarization kicks in.
    pub summarization_threshold: f64,
    /// Number of trailing history messages kept verbatim when summarizing.
    pub preserve_recent_messages: usize,
    /// Embedding model repo ID (HuggingFace, for the local provider) or
    /// provider model name (for the HTTP provider).
    pub embedding_model_id: String,
    pub enable_rag: bool,
    pub enable_memory_db: bool,
    pub enable_cache: bool,
    /// Default TTL for disk-cache entries, in seconds.
    pub cache_ttl_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: ".codegrounds".to_string(),
            scan: ScanConfig::default(),
            chunk_size: 500,
            chunk_overlap: 50,
            top_k_retrieval: 10,
            max_context_tokens: 10_000,
            max_context_tokens_large: 150_000,
            summarization_threshold: 0.75,
            preserve_recent_messages: 8,
            embedding_model_id: "minishlab/potion-retrieval-32M".to_string(),
            enable_rag: true,
            enable_memory_db: true,
            enable_cache: true,
            cache_ttl_seconds: 7 * 24 * 3600,
        }
    }
}

impl Config {
    pub fn max_file_bytes(&self) -> u64 {
        self.scan.max_file_bytes.min(ABSOLUTE_MAX_FILE_BYTES)
    }
}

/// Load `.codegrounds.json` from the workspace root; defaults when the
/// file is absent or malformed.
pub fn load_config(workspace_root: &Path) -> Config {
    let primary = workspace_root.join(".codegrounds.json");

    let Ok(text) = std::fs::read_to_string(&primary) else {
        return Config::default();
    };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|err| {
        tracing::warn!(path = %primary.display(), %err, "malformed config, using defaults");
        Config::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.top_k_retrieval, 10);
        assert_eq!(cfg.preserve_recent_messages, 8);
        assert!((cfg.summarization_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.cache_ttl_seconds, 604_800);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.chunk_size, 500);
    }

    #[test]
    fn partial_config_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".codegrounds.json"),
            r#"{ "top_k_retrieval": 4, "chunk_overlap": 10 }"#,
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.top_k_retrieval, 4);
        assert_eq!(cfg.chunk_overlap, 10);
        assert_eq!(cfg.chunk_size, 500);
    }
}
