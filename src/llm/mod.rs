//! Optional LLM collaborator for natural-language replies.
//!
//! Talks to a chat-completions endpoint with bearer-token auth. The
//! service runs fine without it: when no API key is configured, callers
//! fall back to intent-derived reply strings. Every request carries a
//! hard deadline; this path must never stall the conversation pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

/// Errors returned by the chat collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// No API key configured; the collaborator is disabled.
    #[error("llm collaborator disabled (no API key)")]
    Disabled,
    /// HTTP transport failure.
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Upstream answered with a non-success status.
    #[error("llm returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Response did not match the expected schema.
    #[error("llm response parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Chat-completions request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

/// A message in chat format.
#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Chat-completions response body.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Default completion budget for reply generation.
const DEFAULT_MAX_TOKENS: u32 = 512;

/// Client for the configured chat-completions endpoint.
pub struct ChatClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl ChatClient {
    /// Build a client; usable even when disabled (calls return
    /// [`LlmError::Disabled`]).
    pub fn new(config: LlmConfig) -> Self {
        if config.enabled() && url::Url::parse(&config.base_url).is_err() {
            tracing::warn!(base_url = %config.base_url, "llm base url does not parse; requests will fail");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_deadline_ms))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Whether an API key is configured.
    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    /// Configured model identifier.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Configured base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// One-shot completion of a single user prompt.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.chat(None, prompt).await
    }

    /// Completion with a system prompt.
    pub async fn reply(&self, system: &str, user: &str) -> Result<String, LlmError> {
        self.chat(Some(system), user).await
    }

    async fn chat(&self, system: Option<&str>, user: &str) -> Result<String, LlmError> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(LlmError::Disabled);
        };

        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&ChatRequest {
                model: &self.config.model,
                messages,
                max_tokens: DEFAULT_MAX_TOKENS,
            })
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: ChatResponse =
            serde_json::from_str(&payload).map_err(|e| LlmError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::Parse("no content in first choice".to_owned()))
    }
}

/// Check HTTP response status and return body text or a structured error.
async fn check_http_response(response: reqwest::Response) -> Result<String, LlmError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Scrub bearer tokens and API keys out of upstream error bodies before
/// they reach logs or callers.
fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-[A-Za-z0-9_\-]{16,}",
        r"Bearer\s+[A-Za-z0-9._\-]{16,}",
        r"key-[A-Za-z0-9]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_client() -> ChatClient {
        ChatClient::new(LlmConfig::default())
    }

    #[tokio::test]
    async fn disabled_client_refuses_immediately() {
        let result = disabled_client().complete("hello").await;
        assert!(matches!(result, Err(LlmError::Disabled)));
    }

    #[test]
    fn enabled_follows_api_key_presence() {
        assert!(!disabled_client().enabled());
        let client = ChatClient::new(LlmConfig {
            api_key: Some("sk-test".to_owned()),
            ..LlmConfig::default()
        });
        assert!(client.enabled());
    }

    #[test]
    fn request_serializes_to_chat_completions_shape() {
        let request = ChatRequest {
            model: "phala/llama-3.3-70b-instruct",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "you are terse",
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            max_tokens: 512,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["model"], "phala/llama-3.3-70b-instruct");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 512);
    }

    #[test]
    fn response_parses_first_choice_content() {
        let payload = r#"{"choices":[{"message":{"content":"Hello there"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(payload).expect("parse");
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Hello there")
        );
    }

    #[test]
    fn error_bodies_are_sanitized_and_truncated() {
        let raw = format!(
            "error: invalid key sk-{} and more {}",
            "a".repeat(32),
            "x".repeat(400)
        );
        let sanitized = sanitize_http_error_body(&raw);
        assert!(sanitized.contains("[REDACTED]"));
        assert!(!sanitized.contains(&"a".repeat(32)));
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
