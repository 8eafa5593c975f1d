//! LLM transport and response handling.
//!
//! The core treats the model as a synchronous text channel; everything else
//! (JSON extraction, validation) happens on this side of the boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AgentError;
use perppilot_core::config::LlmConfig;

/// A blocking request/response channel to the model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AgentError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AgentError> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage { role: "system", content: system_prompt });
        }
        messages.push(ChatMessage { role: "user", content: user_prompt });

        let body = ChatRequest { model: &self.model, messages, temperature: 0.2 };

        debug!(model = %self.model, "calling llm");
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!("HTTP {status}: {text}")));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("response parse error: {e}")))?;

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AgentError::Llm("empty completion".to_string()))
    }
}

/// Extracts the first JSON object from free-form model output.
///
/// Handles fenced code blocks and surrounding prose; returns the text
/// between the first `{` and its matching `}`.
#[must_use]
pub fn extract_json(response: &str) -> Option<&str> {
    let text = if let Some(start) = response.find("```") {
        let after = &response[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        response
    };

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
