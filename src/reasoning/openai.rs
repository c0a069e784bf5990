//! OpenAI-compatible chat-completions backend

use super::prompt::{self, ChatMessage};
use super::{ConsolidationRequest, ExtractionRequest, ReasoningService};
use crate::config::ReasoningConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Reasoning service backed by a `/chat/completions` endpoint
pub struct OpenAiReasoningService {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiReasoningService {
    /// Create a client from config, reading the API key from `api_key_env`
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "No API key set, calling the reasoning service without authorization"
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<serde_json::Value> {
        let payload = CompletionRequest {
            model: &self.model,
            messages,
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Reasoning(format!(
                "status {}: {}",
                status,
                truncate(&body, 512)
            )));
        }

        let completion: CompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Reasoning("response has no message content".to_string()))?;

        decode_content(&content)
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoningService {
    async fn extract(&self, request: &ExtractionRequest) -> Result<serde_json::Value> {
        tracing::debug!(
            window_id = %request.window_id,
            participants = request.participants.len(),
            messages = request.messages.len(),
            "Requesting memory extraction"
        );
        self.complete(prompt::extraction_messages(request)).await
    }

    async fn consolidate(&self, request: &ConsolidationRequest) -> Result<serde_json::Value> {
        tracing::debug!(
            user_id = %request.user_id,
            records = request.records.len(),
            target = request.target_count,
            "Requesting memory consolidation"
        );
        self.complete(prompt::consolidation_messages(request)).await
    }
}

/// Parse message content as JSON, tolerating a fenced code block
fn decode_content(content: &str) -> Result<serde_json::Value> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| Error::Parse(format!("reasoning reply is not JSON: {}", e)))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
