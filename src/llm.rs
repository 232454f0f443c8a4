//! Abstract LLM capability (§6): a messages-with-tools call that
//! distinguishes transport/5xx failures from rate-limit (429) responses,
//! so the breaker records failures and only rate-limit errors map to
//! HTTP 429 for callers.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API call failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("error occurred in HTTP middleware calling LLM API: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("LLM returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("LLM rate limit exceeded")]
    RateLimited,

    #[error("no LLM credential configured")]
    Unconfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<Block>,
    pub stop_reason: StopReason,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn messages(
        &self, model: &str, system: &str, messages: &[Message], tools: &[ToolSpec], max_tokens: u32,
    ) -> Result<MessagesResponse, LlmError>;

    fn is_configured(&self) -> bool;
}

/// Anthropic-messages-API-shaped client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: ClientWithMiddleware,
    base_url: url::Url,
    api_key: Option<Secret<String>>,
}

impl AnthropicClient {
    pub fn new(base_url: url::Url, api_key: Option<Secret<String>>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(time::Duration::from_secs(60))
            .pool_max_idle_per_host(5)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(time::Duration::from_millis(500), time::Duration::from_secs(10))
            .build_with_max_retries(2);

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, base_url, api_key })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    #[tracing::instrument(level = "debug", skip(self, system, messages, tools))]
    async fn messages(
        &self, model: &str, system: &str, messages: &[Message], tools: &[ToolSpec], max_tokens: u32,
    ) -> Result<MessagesResponse, LlmError> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(LlmError::Unconfigured);
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
                .map_err(|err| LlmError::MalformedResponse(err.to_string()))?,
        );

        let mut url = self.base_url.clone();
        url.path_segments_mut().map_err(|()| LlmError::MalformedResponse("base url".into()))?.push("v1").push("messages");

        let body = serde_json::json!({
            "model": model,
            "system": system,
            "messages": messages,
            "tools": tools,
            "max_tokens": max_tokens,
        });

        let response = self.client.post(url).headers(headers).json(&body).send().await?;

        if response.status().as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        let response = response.error_for_status()?;

        response.json::<MessagesResponse>().await.map_err(LlmError::HttpRequest)
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_refuses_to_call() {
        let client = AnthropicClient::new("https://api.anthropic.com".parse().unwrap(), None).unwrap();
        assert!(!client.is_configured());
        let result = client.messages("claude-haiku", "", &[], &[], 10).await;
        assert!(matches!(result, Err(LlmError::Unconfigured)));
    }
}
