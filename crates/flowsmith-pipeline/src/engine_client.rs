//! Client for the external workflow execution engine.
//!
//! The engine is the system that actually hosts and runs staged workflows.
//! Everything crosses this boundary as JSON produced by
//! [`WorkflowConfig::to_engine_json`](crate::graph::WorkflowConfig::to_engine_json);
//! the trait exists so the pipeline and its tests can run against an
//! in-process fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use url::Url;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Status of one execution previously kicked off with
/// [`WorkflowEngine::trigger_test`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub handle: String,
    /// Engine-reported state, e.g. "running", "success", "error".
    pub state: String,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Operations the external engine exposes.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Register a new workflow; returns the engine's id for it.
    async fn create_workflow(&self, config: &Value) -> Result<String>;

    /// Replace the config of an already registered workflow.
    async fn update_workflow(&self, external_id: &str, config: &Value) -> Result<()>;

    async fn activate(&self, external_id: &str) -> Result<()>;

    async fn deactivate(&self, external_id: &str) -> Result<()>;

    /// Run the workflow once against test input; returns an execution handle.
    async fn trigger_test(&self, external_id: &str, input: &Value) -> Result<String>;

    async fn execution_status(&self, handle: &str) -> Result<ExecutionStatus>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

/// REST client for the engine's management API.
pub struct HttpWorkflowEngine {
    client: reqwest::Client,
    base: Url,
    api_key: String,
}

impl HttpWorkflowEngine {
    pub fn new(config: EngineClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| PipelineError::External {
            reason: format!("bad engine base url: {e}"),
            retryable: false,
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(PipelineError::from)?;
        Ok(Self {
            client,
            base,
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| PipelineError::External {
            reason: format!("bad engine endpoint {path}: {e}"),
            retryable: false,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retryable = status.is_server_error() || status.as_u16() == 429;
        let text = response.text().await.unwrap_or_default();
        Err(PipelineError::External {
            reason: format!("engine returned {status}: {text}"),
            retryable,
        })
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    #[instrument(skip(self, config))]
    async fn create_workflow(&self, config: &Value) -> Result<String> {
        let url = self.endpoint("workflows")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(config)
            .send()
            .await?;
        let payload: Value = Self::check(response).await?.json().await?;
        payload["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::External {
                reason: "engine create response missing id".into(),
                retryable: false,
            })
    }

    #[instrument(skip(self, config))]
    async fn update_workflow(&self, external_id: &str, config: &Value) -> Result<()> {
        let url = self.endpoint(&format!("workflows/{external_id}"))?;
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.api_key)
            .json(config)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn activate(&self, external_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("workflows/{external_id}/activate"))?;
        let response = self.client.post(url).bearer_auth(&self.api_key).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deactivate(&self, external_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("workflows/{external_id}/deactivate"))?;
        let response = self.client.post(url).bearer_auth(&self.api_key).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, input))]
    async fn trigger_test(&self, external_id: &str, input: &Value) -> Result<String> {
        let url = self.endpoint(&format!("workflows/{external_id}/test"))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(input)
            .send()
            .await?;
        let payload: Value = Self::check(response).await?.json().await?;
        payload["execution_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::External {
                reason: "engine test response missing execution_id".into(),
                retryable: false,
            })
    }

    #[instrument(skip(self))]
    async fn execution_status(&self, handle: &str) -> Result<ExecutionStatus> {
        let url = self.endpoint(&format!("executions/{handle}"))?;
        let response = self.client.get(url).bearer_auth(&self.api_key).send().await?;
        let status: ExecutionStatus = Self::check(response).await?.json().await?;
        Ok(status)
    }
}
