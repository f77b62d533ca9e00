//! Chat-provider contract used by the summarizer, plus the message types
//! shared across the context pipeline.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
}

/// Contract with an LLM backend. `content` is non-null on success;
/// transient failures are reported as [`CoreError::Transient`].
pub trait ChatProvider: Send + Sync {
    fn chat(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> CoreResult<ChatResponse>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

/// Deadline for one chat-completion HTTP request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct HttpChatProvider {
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl HttpChatProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl ChatProvider for HttpChatProvider {
    fn chat(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> CoreResult<ChatResponse> {
        let payload: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let response = ureq::post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(serde_json::json!({
                "model": model,
                "messages": payload,
                "temperature": temperature,
                "max_tokens": max_tokens,
            }));

        let response = match response {
            Ok(r) => r,
            Err(ureq::Error::Status(code, r)) if code == 429 || code >= 500 => {
                return Err(CoreError::Transient(format!(
                    "chat endpoint returned {code}: {}",
                    r.status_text()
                )));
            }
            Err(ureq::Error::Status(code, r)) => {
                return Err(CoreError::InvalidInput(format!(
                    "chat endpoint returned {code}: {}",
                    r.status_text()
                )));
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(CoreError::Transient(format!("chat transport: {t}")));
            }
        };

        let parsed: ChatCompletionResponse = response
            .into_json()
            .map_err(|e| CoreError::Internal(format!("chat response decode: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("chat response had no choices".into()))?;
        let content = choice
            .message
            .content
            .ok_or_else(|| CoreError::Internal("chat response content was null".into()))?;

        Ok(ChatResponse {
            content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }
}
