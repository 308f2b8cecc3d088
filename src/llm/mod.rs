//! Chat-completions client for OpenAI-compatible providers
//!
//! Only what the reflector and curator need: a single non-streaming request
//! that asks for a JSON object back.

pub mod structured;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::config::LlmConfig;

/// Where requests go and how they authenticate
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL for the API (e.g., "https://api.openai.com/v1")
    pub base_url: String,
    /// Bearer token; local gateways often need none
    pub api_key: Option<String>,
    /// Extra headers to include in requests
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            extra_headers: Vec::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.base_url.clone(), config.resolved_api_key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

/// The first choice of a completion response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Set when the model declined to answer
    pub refusal: Option<String>,
    pub finish_reason: Option<String>,
}

/// Chat-completions client
#[derive(Clone)]
pub struct LlmClient {
    client: Arc<Client>,
    provider: ProviderConfig,
}

impl LlmClient {
    pub fn with_provider(provider: ProviderConfig) -> Self {
        Self {
            client: Arc::new(Client::new()),
            provider,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::with_provider(ProviderConfig::from_config(config))
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Send a chat completion request in JSON-object mode
    pub async fn complete_json(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Completion> {
        let request = ChatRequest {
            model,
            messages,
            max_tokens,
            temperature,
            response_format: Some(serde_json::json!({ "type": "json_object" })),
        };

        let mut req_builder = self
            .client
            .post(format!("{}/chat/completions", self.provider.base_url));
        if let Some(api_key) = &self.provider.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }
        for (key, value) in &self.provider.extra_headers {
            req_builder = req_builder.header(key.as_str(), value.as_str());
        }

        let response = req_builder
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, truncate(&body, 500));
        }

        let body = response.text().await.context("Failed to read response body")?;
        debug!(model, bytes = body.len(), "LLM response received");

        parse_completion(&body)
    }
}

/// Pull the first choice out of a raw chat-completions body.
///
/// Content may be a plain string or an array of `{"type": "text"}` parts.
pub fn parse_completion(body: &str) -> Result<Completion> {
    let raw: Value = serde_json::from_str(body).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse JSON response: {} (body: {})",
            e,
            truncate(body, 500)
        )
    })?;

    let Some(choice) = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
    else {
        bail!("LLM response has no choices (body: {})", truncate(body, 500));
    };

    let message = choice.get("message");
    let content = match message.and_then(|msg| msg.get("content")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    };

    let refusal = message
        .and_then(|msg| msg.get("refusal"))
        .and_then(|r| r.as_str())
        .filter(|r| !r.trim().is_empty())
        .map(|r| r.to_string());

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(|r| r.to_string());

    Ok(Completion {
        content,
        refusal,
        finish_reason,
    })
}

/// Cut `text` to at most `max` bytes on a char boundary
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_asks_for_json_object() {
        let messages = vec![ChatMessage::system("be terse"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: None,
            temperature: Some(0.2),
            response_format: Some(serde_json::json!({ "type": "json_object" })),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][1]["role"], "user");
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_string_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"},"finish_reason":"stop"}]}"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.content, r#"{"a":1}"#);
        assert_eq!(completion.refusal, None);
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_content_parts_and_refusal() {
        let body = r#"{"choices":[{"message":{"content":[{"type":"text","text":"he"},{"type":"text","text":"llo"}]}}]}"#;
        assert_eq!(parse_completion(body).unwrap().content, "hello");

        let body = r#"{"choices":[{"message":{"content":null,"refusal":"I can't help with that"}}]}"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.content, "");
        assert_eq!(completion.refusal.as_deref(), Some("I can't help with that"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_completion("not json").is_err());
        assert!(parse_completion(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn test_provider_trims_trailing_slash() {
        let provider = ProviderConfig::new("http://localhost:8080/v1/", None);
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
    }
}
