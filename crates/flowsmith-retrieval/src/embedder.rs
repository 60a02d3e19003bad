//! Embedding backend interface and HTTP client.
//!
//! The engine talks to the embedding service through the
//! [`EmbeddingBackend`] trait so tests can inject deterministic mocks. The
//! shipped implementation targets OpenAI-compatible `/embeddings` endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{Result, RetrievalError};

/// A service that turns text into a fixed-dimension vector.
///
/// The dimension must be identical for every call against the same store;
/// the knowledge store enforces this on write.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Configuration for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl EmbeddingClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: 30,
        }
    }
}

/// `reqwest`-based embedding client.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingBackend {
    config: EmbeddingClientConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingBackend {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrievalError::Backend {
                reason: format!("failed to build HTTP client: {e}"),
                retryable: false,
            })?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "input": text,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            // 5xx and 429 are worth retrying; other 4xx are permanent.
            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(RetrievalError::Backend {
                reason: format!("embedding request failed ({status}): {detail}"),
                retryable,
            });
        }

        let parsed: EmbeddingsResponse =
            response.json().await.map_err(|e| RetrievalError::Backend {
                reason: format!("malformed embeddings response: {e}"),
                retryable: false,
            })?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| RetrievalError::Backend {
                reason: "embeddings response contained no data".into(),
                retryable: false,
            })?;

        if vector.is_empty() {
            return Err(RetrievalError::Backend {
                reason: "embedding backend returned an empty vector".into(),
                retryable: false,
            });
        }

        debug!(dimension = vector.len(), "embedded text");
        Ok(vector)
    }
}
