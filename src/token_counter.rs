//! Model-specific token counting.
//!
//! Encoding family is selected by a static table; unknown models fall
//! back to the default encoding. Message counting adds a fixed per-message
//! overhead for the chat-format scaffolding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;

use crate::llm::Message;

/// Approximate structural overhead per chat message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

const DEFAULT_ENCODING: &str = "cl100k_base";

/// Static model → encoding-family table. Prefix matching keeps dated
/// model ids ("gpt-4o-2024-11-20") on the right family.
const ENCODING_TABLE: &[(&str, &str)] = &[
    ("gpt-4o", "o200k_base"),
    ("o1", "o200k_base"),
    ("o3", "o200k_base"),
    ("gpt-4", "cl100k_base"),
    ("gpt-3.5", "cl100k_base"),
    ("deepseek", "cl100k_base"),
    ("claude", "cl100k_base"),
];

fn encoding_family(model: &str) -> &'static str {
    let model = model.to_lowercase();
    for (prefix, family) in ENCODING_TABLE {
        if model.starts_with(prefix) {
            return family;
        }
    }
    DEFAULT_ENCODING
}

pub struct TokenCounter {
    encodings: Mutex<HashMap<&'static str, Arc<CoreBPE>>>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            encodings: Mutex::new(HashMap::new()),
        }
    }

    fn encoding(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let family = encoding_family(model);
        let mut cache = self.encodings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bpe) = cache.get(family) {
            return Some(Arc::clone(bpe));
        }
        let bpe = match family {
            "o200k_base" => tiktoken_rs::o200k_base(),
            _ => tiktoken_rs::cl100k_base(),
        }
        .or_else(|_| tiktoken_rs::cl100k_base())
        .map(Arc::new)
        .ok()?;
        cache.insert(family, Arc::clone(&bpe));
        Some(bpe)
    }

    pub fn count_text(&self, text: &str, model: &str) -> usize {
        match self.encoding(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            // The bundled encodings should always load; estimate rather
            // than fail if they somehow do not.
            None => text.len() / 4,
        }
    }

    /// Total tokens across a message list, including role tokens and the
    /// per-message overhead.
    pub fn count_messages(&self, messages: &[Message], model: &str) -> usize {
        messages
            .iter()
            .map(|m| {
                self.count_text(m.role.as_str(), model)
                    + self.count_text(&m.content, model)
                    + MESSAGE_OVERHEAD_TOKENS
            })
            .sum()
    }
}
