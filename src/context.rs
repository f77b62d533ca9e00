//! Budget-driven message-list construction.
//!
//! Owns no state: a pure function of its inputs plus read-only references
//! to the token counter, summarizer, and facts store. System messages
//! always precede the conversation tail, and the tail keeps its original
//! relative order.

use crate::config::Config;
use crate::facts::{format_facts, FactsStore};
use crate::llm::{Message, Role};
use crate::summarizer::{Summarizer, DEFAULT_SUMMARY_TOKENS, SUMMARY_SENTINEL};
use crate::token_counter::TokenCounter;

/// Tokens reserved for the model's response during aggressive truncation.
pub const RESPONSE_HEADROOM_TOKENS: usize = 500;

/// At most this many facts are injected into one context.
pub const MAX_FACTS_IN_CONTEXT: usize = 10;

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub facts_used: usize,
    pub summary_used: bool,
}

pub struct ContextAssembler<'a> {
    token_counter: &'a TokenCounter,
    summarizer: &'a Summarizer,
    facts: Option<&'a FactsStore>,
    max_context_tokens: usize,
    max_context_tokens_large: usize,
    summarization_threshold: f64,
    preserve_recent: usize,
}

/// Large-window regime is chosen by model family.
fn is_large_context_model(model: &str) -> bool {
    model.to_lowercase().contains("claude")
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        token_counter: &'a TokenCounter,
        summarizer: &'a Summarizer,
        facts: Option<&'a FactsStore>,
        config: &Config,
    ) -> Self {
        Self {
            token_counter,
            summarizer,
            facts,
            max_context_tokens: config.max_context_tokens,
            max_context_tokens_large: config.max_context_tokens_large,
            summarization_threshold: config.summarization_threshold.clamp(0.0, 1.0),
            preserve_recent: config.preserve_recent_messages,
        }
    }

    /// Assemble the message list for one LLM call, guaranteed to fit the
    /// model's context budget.
    pub fn assemble(
        &self,
        user_message: &str,
        history: &[Message],
        rag_context: &str,
        system_prompt: &str,
        model: &str,
        session_id: Option<&str>,
    ) -> AssembledContext {
        let max_tokens = if is_large_context_model(model) {
            self.max_context_tokens_large
        } else {
            self.max_context_tokens
        };
        let threshold = (max_tokens as f64 * self.summarization_threshold) as usize;

        // Facts relevant to this request, newest-first.
        let facts = match (self.facts, session_id) {
            (Some(store), Some(session)) => store
                .relevant_facts(session, user_message, MAX_FACTS_IN_CONTEXT)
                .unwrap_or_else(|err| {
                    tracing::warn!(%err, "facts lookup failed, assembling without facts");
                    vec![]
                }),
            _ => vec![],
        };

        let mut messages: Vec<Message> = vec![Message::system(system_prompt)];
        if !rag_context.is_empty() {
            messages.push(Message::system(format!(
                "<codebase_context>\n{rag_context}\n</codebase_context>"
            )));
        }
        if !facts.is_empty() {
            messages.push(Message::system(format_facts(&facts)));
        }

        let mut summary_used = false;
        if !history.is_empty() {
            if self.token_counter.count_messages(history, model) < threshold {
                messages.extend(history.iter().cloned());
            } else {
                let result =
                    self.summarizer
                        .summarize(history, DEFAULT_SUMMARY_TOKENS, self.preserve_recent);
                if let Some(summary) = result.summary_message {
                    summary_used = true;
                    messages.push(summary);
                }
                messages.extend(result.recent_messages);
            }
        }

        messages.push(Message::user(user_message));

        let mut token_count = self.token_counter.count_messages(&messages, model);
        if token_count > max_tokens {
            messages = self.truncate_aggressively(messages, max_tokens, model);
            token_count = self.token_counter.count_messages(&messages, model);
        }

        summary_used = summary_used
            || messages
                .iter()
                .any(|m| m.content.starts_with(SUMMARY_SENTINEL));

        AssembledContext {
            messages,
            token_count,
            facts_used: facts.len(),
            summary_used,
        }
    }

    /// Last-resort budget enforcement: keep all system messages and the
    /// latest user message, then re-admit tail messages newest-first
    /// until the budget (minus response headroom) is spent.
    fn truncate_aggressively(
        &self,
        messages: Vec<Message>,
        max_tokens: usize,
        model: &str,
    ) -> Vec<Message> {
        let (system_messages, mut tail): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(|m| m.role == Role::System);

        let last_message = tail.pop();

        let mut reserved = self.token_counter.count_messages(&system_messages, model);
        if let Some(last) = &last_message {
            reserved += self.token_counter.count_messages(std::slice::from_ref(last), model);
        }
        let budget = max_tokens
            .saturating_sub(reserved)
            .saturating_sub(RESPONSE_HEADROOM_TOKENS);

        // Admit from the end so the newest exchanges survive; insertion
        // at a fixed point preserves their original relative order.
        let mut kept: Vec<Message> = Vec::new();
        let mut used = 0usize;
        for msg in tail.into_iter().rev() {
            let cost = self
                .token_counter
                .count_messages(std::slice::from_ref(&msg), model);
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.insert(0, msg);
        }

        let mut out = system_messages;
        out.extend(kept);
        out.extend(last_message);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::llm::test_support::FakeChatProvider;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const MODEL: &str = "gpt-4";

    fn config(max_tokens: usize) -> Config {
        Config {
            max_context_tokens: max_tokens,
            max_context_tokens_large: max_tokens * 10,
            ..Config::default()
        }
    }

    fn history(turns: usize, padding: usize) -> Vec<Message> {
        (0..turns)
            .map(|i| {
                let body = format!("turn {i} {}", "word ".repeat(padding));
                if i % 2 == 0 {
                    Message::user(body)
                } else {
                    Message::assistant(body)
                }
            })
            .collect()
    }

    #[test]
    fn zero_history_with_rag_context_yields_three_messages() {
        let counter = TokenCounter::new();
        let summarizer = Summarizer::disabled();
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &config(10_000));

        let out = assembler.assemble("do the thing", &[], "retrieved code", "sys", MODEL, None);

        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].content, "sys");
        assert!(out.messages[1].content.starts_with("<codebase_context>"));
        assert_eq!(out.messages[2], Message::user("do the thing"));
        assert_eq!(out.facts_used, 0);
        assert!(!out.summary_used);
    }

    #[test]
    fn history_under_threshold_is_included_verbatim_without_summarizer_call() {
        let provider = Arc::new(FakeChatProvider::with_reply("unused"));
        let counter = TokenCounter::new();
        let summarizer = Summarizer::new(Some(provider.clone()), MODEL);
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &config(10_000));

        let hist = history(6, 2);
        let out = assembler.assemble("next", &hist, "", "sys", MODEL, None);

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        // system + 6 history + user
        assert_eq!(out.messages.len(), 8);
        assert_eq!(out.messages[1..7], hist[..]);
    }

    #[test]
    fn history_over_threshold_is_summarized() {
        let provider = Arc::new(FakeChatProvider::with_reply("did many things"));
        let counter = TokenCounter::new();
        let summarizer = Summarizer::new(Some(provider), MODEL)
            .with_retry_policy(RetryPolicy::immediate(1));
        let cfg = config(600);
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &cfg);

        let hist = history(20, 30);
        let out = assembler.assemble("next", &hist, "", "sys", MODEL, None);

        assert!(out.summary_used);
        let summary = out
            .messages
            .iter()
            .find(|m| m.content.starts_with(SUMMARY_SENTINEL))
            .expect("summary message present");
        assert!(summary.content.contains("did many things"));
        assert!(out.token_count <= 600);
    }

    #[test]
    fn tight_budget_is_enforced_with_tail_preserved() {
        let counter = TokenCounter::new();
        let summarizer = Summarizer::disabled();
        let cfg = config(2_000);
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &cfg);

        // 30 turns at ~210 tokens each plus a ~1,200-token RAG block.
        let hist = history(30, 200);
        let rag = "code ".repeat(1_200);
        let out = assembler.assemble("final question", &hist, &rag, "sys", MODEL, None);

        assert!(out.token_count <= 2_000, "budget exceeded: {}", out.token_count);
        assert_eq!(out.messages[0].content, "sys");
        assert!(out.messages[1].content.starts_with("<codebase_context>"));
        assert_eq!(
            out.messages.last().unwrap(),
            &Message::user("final question")
        );

        // Any surviving history must come from the tail, not the head.
        let surviving: Vec<&Message> = out
            .messages
            .iter()
            .filter(|m| m.role != Role::System && m.content.starts_with("turn "))
            .collect();
        for msg in surviving {
            let idx: usize = msg
                .content
                .split_whitespace()
                .nth(1)
                .unwrap()
                .parse()
                .unwrap();
            assert!(idx >= 15, "head-of-history message {idx} survived truncation");
        }
    }

    #[test]
    fn unavailable_summarizer_still_meets_budget() {
        let provider = Arc::new(FakeChatProvider::failing(CoreError::Unavailable(
            "no key".into(),
        )));
        let counter = TokenCounter::new();
        let summarizer = Summarizer::new(Some(provider), MODEL)
            .with_retry_policy(RetryPolicy::immediate(1));
        let cfg = config(1_500);
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &cfg);

        let hist = history(30, 100);
        let out = assembler.assemble("q", &hist, "", "sys", MODEL, None);

        assert!(!out.summary_used);
        assert!(out.token_count <= 1_500);
        assert_eq!(out.messages.last().unwrap(), &Message::user("q"));
    }

    #[test]
    fn large_model_family_uses_the_large_budget() {
        let counter = TokenCounter::new();
        let summarizer = Summarizer::disabled();
        let cfg = config(400);
        let assembler = ContextAssembler::new(&counter, &summarizer, None, &cfg);

        let hist = history(10, 40);
        let small = assembler.assemble("q", &hist, "", "sys", MODEL, None);
        let large = assembler.assemble("q", &hist, "", "sys", "claude-3-5-sonnet", None);

        // The small regime must truncate; the large one fits everything.
        assert!(small.messages.len() < large.messages.len());
        assert_eq!(large.messages.len(), hist.len() + 2);
    }

    #[test]
    fn facts_are_injected_as_a_system_message() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FactsStore::open(&tmp.path().join("memory.db")).unwrap();
        store
            .save_facts(
                "s1",
                &crate::facts::extract_facts(&[Message::assistant(
                    "created file: billing.py and implemented function charge",
                )]),
            )
            .unwrap();

        let counter = TokenCounter::new();
        let summarizer = Summarizer::disabled();
        let cfg = config(10_000);
        let assembler = ContextAssembler::new(&counter, &summarizer, Some(&store), &cfg);

        let out = assembler.assemble("update billing flow", &[], "", "sys", MODEL, Some("s1"));
        assert!(out.facts_used >= 1);
        let facts_msg = out
            .messages
            .iter()
            .find(|m| m.content.starts_with("[Key Facts"))
            .expect("facts message present");
        assert!(facts_msg.content.contains("billing.py"));
    }
}
