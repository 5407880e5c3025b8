//! Embedding client and vector utilities.
//!
//! Two remote providers are supported: an Azure OpenAI embeddings
//! deployment (shares the chat endpoint and API key) and a local Ollama
//! instance's `/api/embed`. The `disabled` provider always errors; building
//! a client with it fails up front, which makes a missing embedding
//! configuration fatal to ingestion rather than silently degraded.
//!
//! Retry strategy for both providers:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::Config;

#[derive(Debug)]
enum Provider {
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
        api_key: String,
    },
    Ollama {
        url: String,
        model: String,
    },
}

#[derive(Debug)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    provider: Provider,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl EmbeddingClient {
    /// Build the client from configuration.
    ///
    /// Fails when the provider is `disabled` or its credentials are missing,
    /// so callers surface the problem before touching the vector index.
    pub fn new(config: &Config) -> Result<Self> {
        let embedding = &config.embedding;
        let dims = embedding
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims not configured"))?;

        let provider = match embedding.provider.as_str() {
            "azure" => {
                let api_key = std::env::var(&config.model.api_key_env).map_err(|_| {
                    anyhow::anyhow!(
                        "{} environment variable not set; cannot create embeddings",
                        config.model.api_key_env
                    )
                })?;
                Provider::Azure {
                    endpoint: config.model.endpoint.trim_end_matches('/').to_string(),
                    deployment: embedding
                        .deployment
                        .clone()
                        .unwrap_or_else(|| "text-embedding-3-large".to_string()),
                    api_version: config.model.api_version.clone(),
                    api_key,
                }
            }
            "ollama" => Provider::Ollama {
                url: embedding
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                model: embedding
                    .model
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama"))?,
            },
            "disabled" => bail!("Embedding provider is disabled"),
            other => bail!("Unknown embedding provider: {}", other),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(embedding.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            provider,
            dims,
            batch_size: embedding.batch_size,
            max_retries: embedding.max_retries,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a batch of texts, preserving input order. Inputs larger than
    /// the configured batch size are split into multiple API calls.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let mut vectors = self.embed_batch(batch).await?;
            all.append(&mut vectors);
        }
        if all.len() != texts.len() {
            bail!(
                "Embedding response count mismatch: sent {}, got {}",
                texts.len(),
                all.len()
            );
        }
        Ok(all)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let (url, body, api_key) = match &self.provider {
            Provider::Azure {
                endpoint,
                deployment,
                api_version,
                api_key,
            } => (
                format!(
                    "{}/openai/deployments/{}/embeddings?api-version={}",
                    endpoint, deployment, api_version
                ),
                serde_json::json!({ "input": texts }),
                Some(api_key.clone()),
            ),
            Provider::Ollama { url, model } => (
                format!("{}/api/embed", url),
                serde_json::json!({ "model": model, "input": texts }),
                None,
            ),
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &api_key {
                request = request.header("api-key", key.as_str());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return match &self.provider {
                            Provider::Azure { .. } => parse_openai_embeddings(&json),
                            Provider::Ollama { .. } => parse_ollama_embeddings(&json),
                        };
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embedding API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// Parse an OpenAI-shaped embeddings response: `data[].embedding`.
fn parse_openai_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

/// Parse an Ollama `/api/embed` response: `embeddings[][]`.
fn parse_ollama_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors. Returns `0.0` for empty or
/// mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2], "index": 0},
                {"embedding": [0.3, 0.4], "index": 1}
            ]
        });
        let vecs = parse_openai_embeddings(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[1], vec![0.3f32, 0.4]);
    }

    #[test]
    fn parse_ollama_shape() {
        let json = serde_json::json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]});
        let vecs = parse_ollama_embeddings(&json).unwrap();
        assert_eq!(vecs.len(), 2);
    }

    #[test]
    fn disabled_provider_fails_construction() {
        let config: Config = toml::from_str(
            r#"
[state]
path = "/tmp/x.sqlite"

[model]
endpoint = "https://example.openai.azure.com"

[embedding]
provider = "disabled"
dims = 8

[server]
bind = "127.0.0.1:0"
"#,
        )
        .unwrap();
        let err = EmbeddingClient::new(&config).unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
