//! Chat model client.
//!
//! [`ChatModel`] is the seam between the orchestration logic and the hosted
//! model; production traffic goes through [`AzureChatModel`], tests use
//! mocks. The client retries transient failures (HTTP 429/5xx, network
//! errors) with exponential backoff. This is distinct from the semantic
//! fallback in the ask pipeline, which reacts to *successful* calls whose
//! content is unusable.
//!
//! Streaming consumes the server-sent-event body incrementally and forwards
//! each content delta to the caller: a lazy, finite, non-restartable
//! sequence, used purely to pace I/O.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::session::ChatMessage;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send the conversation and return the full response text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Like [`complete`](ChatModel::complete), but forwards each token to
    /// `on_token` as it arrives. The default implementation degrades to a
    /// single callback with the whole response.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let text = self.complete(messages).await?;
        on_token(&text);
        Ok(text)
    }
}

/// Chat client for an Azure OpenAI deployment.
pub struct AzureChatModel {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    api_key: String,
    temperature: f64,
    max_retries: u32,
}

impl AzureChatModel {
    /// Build the client from configuration. Fails when the API key
    /// environment variable is missing, which blocks all further
    /// interaction.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            deployment: config.deployment.clone(),
            api_version: config.api_version.clone(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn url(&self) -> String {
        chat_completions_url(&self.endpoint, &self.deployment, &self.api_version)
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(self.url())
                .header("api-key", self.api_key.as_str())
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Model API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Model API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Model call failed after retries")))
    }
}

#[async_trait]
impl ChatModel for AzureChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "messages": messages,
            "temperature": self.temperature,
        });

        let response = self.send(&body).await?;
        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let body = serde_json::json!({
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
        });

        let response = self.send(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut out = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);

            // Process complete lines; a partial line stays buffered so
            // multi-byte characters are never split.
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end();

                if let Some(data) = line.strip_prefix("data: ") {
                    if data.trim() == "[DONE]" {
                        return Ok(out);
                    }
                    if let Some(delta) = delta_content(data) {
                        on_token(&delta);
                        out.push_str(&delta);
                    }
                }
            }
        }

        Ok(out)
    }
}

fn chat_completions_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint, deployment, api_version
    )
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid model response: missing message content"))
}

/// Extract the content delta from one streamed event payload, if any.
/// Events without content (role preambles, empty choice lists, filter
/// results) yield `None`.
fn delta_content(data: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}
