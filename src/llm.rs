use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::LlmConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Chat-completion capability the worker's tools call into.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

pub struct OpenAiCompatibleBackend {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: &str, api_key: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1_000)))
            .build()
            .context("failed creating completion client")?;
        Ok(Self {
            client,
            endpoint: resolve_chat_completion_endpoint(base_url),
            api_key: api_key.trim().to_owned(),
        })
    }

    /// `None` when no credential is configured.
    pub fn from_config(llm: &LlmConfig) -> Result<Option<Self>> {
        llm.credential()
            .map(|key| Self::new(&llm.base_url, key, llm.timeout_ms))
            .transpose()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("completion request to {} failed", self.endpoint))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed reading completion body from {}", self.endpoint))?;
        if !status.is_success() {
            return Err(anyhow!(
                "completion endpoint {} returned status={} body={}",
                self.endpoint,
                status.as_u16(),
                truncate_text(&body, 240)
            ));
        }
        let parsed: Value = serde_json::from_str(&body).with_context(|| {
            format!(
                "completion endpoint returned invalid JSON: {}",
                truncate_text(&body, 240)
            )
        })?;
        extract_message_content(&parsed).ok_or_else(|| {
            anyhow!(
                "completion response is missing choices: {}",
                truncate_text(&parsed.to_string(), 240)
            )
        })
    }
}

/// `choices[0].message.content`, accepting either a string or an array of
/// text parts.
fn extract_message_content(parsed: &Value) -> Option<String> {
    let content = parsed.pointer("/choices/0/message/content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
        ),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn resolve_chat_completion_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/v1/chat/completions".to_owned();
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.contains("/chat/completions") {
        return trimmed.to_owned();
    }
    if lower.ends_with("/v1") {
        return format!("{trimmed}/chat/completions");
    }
    format!("{trimmed}/v1/chat/completions")
}

fn truncate_text(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = value[..end].to_owned();
    out.push_str("...");
    out
}
