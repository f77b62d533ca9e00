//! Conversation-tail compression.
//!
//! Delegates to an LLM with a fixed instruction: preserve file creations,
//! symbols added, decisions made, errors fixed. Degrades gracefully:
//! when no provider is configured or the call fails, the input messages
//! pass through unchanged and the caller's aggressive-truncation step
//! still guarantees the token budget.

use std::sync::Arc;

use crate::error::CoreResult;
use crate::llm::{ChatProvider, Message};
use crate::retry::{with_retry, RetryPolicy};

/// Prefix marking a synthetic summary message.
pub const SUMMARY_SENTINEL: &str = "[Previous conversation summary]: ";

pub const DEFAULT_SUMMARY_TOKENS: u32 = 500;
pub const DEFAULT_PRESERVE_RECENT: usize = 5;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Create concise \
summaries that preserve key information: files created, functions added, decisions made, \
errors fixed, and important context.";

/// Per-message excerpt cap inside the summary prompt.
const PROMPT_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct SummaryStats {
    pub original_count: usize,
    pub summarized: bool,
}

#[derive(Debug, Clone)]
pub struct SummaryResult {
    /// Synthetic system message replacing the summarized prefix; `None`
    /// when summarization was skipped or degraded.
    pub summary_message: Option<Message>,
    pub recent_messages: Vec<Message>,
    pub stats: SummaryStats,
}

fn passthrough(messages: &[Message]) -> SummaryResult {
    SummaryResult {
        summary_message: None,
        recent_messages: messages.to_vec(),
        stats: SummaryStats {
            original_count: messages.len(),
            summarized: false,
        },
    }
}

pub struct Summarizer {
    provider: Option<Arc<dyn ChatProvider>>,
    model: String,
    retry: RetryPolicy,
}

impl Summarizer {
    pub fn new(provider: Option<Arc<dyn ChatProvider>>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Summarizer with no backing provider: always passes through.
    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Compress everything except the last `preserve_recent` messages
    /// into one summary message. Never fails: degraded outcomes return
    /// the input unchanged.
    pub fn summarize(
        &self,
        messages: &[Message],
        max_summary_tokens: u32,
        preserve_recent: usize,
    ) -> SummaryResult {
        let Some(provider) = &self.provider else {
            return passthrough(messages);
        };
        if messages.len() <= preserve_recent {
            return passthrough(messages);
        }

        let split = messages.len() - preserve_recent;
        let (old, recent) = messages.split_at(split);

        match self.request_summary(provider.as_ref(), old, max_summary_tokens) {
            Ok(summary_text) => SummaryResult {
                summary_message: Some(Message::system(format!(
                    "{SUMMARY_SENTINEL}{summary_text}"
                ))),
                recent_messages: recent.to_vec(),
                stats: SummaryStats {
                    original_count: old.len(),
                    summarized: true,
                },
            },
            Err(err) => {
                tracing::warn!(%err, category = err.category(), "summarization degraded");
                SummaryResult {
                    summary_message: None,
                    recent_messages: recent.to_vec(),
                    stats: SummaryStats {
                        original_count: old.len(),
                        summarized: false,
                    },
                }
            }
        }
    }

    fn request_summary(
        &self,
        provider: &dyn ChatProvider,
        old: &[Message],
        max_summary_tokens: u32,
    ) -> CoreResult<String> {
        let prompt = build_summary_prompt(old, max_summary_tokens);
        let request = [Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)];
        let response = with_retry(self.retry, "summarize", || {
            provider.chat(&request, &self.model, 0.3, max_summary_tokens)
        })?;
        Ok(response.content)
    }
}

fn build_summary_prompt(messages: &[Message], max_tokens: u32) -> String {
    let mut formatted: Vec<String> = Vec::with_capacity(messages.len());
    for msg in messages {
        let excerpt: String = msg.content.chars().take(PROMPT_EXCERPT_CHARS).collect();
        formatted.push(format!("{}: {excerpt}", msg.role.as_str().to_uppercase()));
    }

    format!(
        "Summarize this conversation history, preserving:\n\
         - Files created or modified\n\
         - Functions/classes added\n\
         - Important decisions made\n\
         - Errors fixed and solutions\n\
         - Key context for future reference\n\n\
         Keep the summary under {max_tokens} tokens and focus on actionable information.\n\n\
         Conversation:\n{}\n\nSummary:",
        formatted.join("\n")
    )
}
