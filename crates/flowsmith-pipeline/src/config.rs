//! Pipeline configuration from the environment.
//!
//! Reads a `.env` file when present, then environment variables:
//! - `FLOWSMITH_LLM_BASE_URL`, `FLOWSMITH_LLM_API_KEY`, `FLOWSMITH_LLM_MODEL`
//! - `FLOWSMITH_ENGINE_BASE_URL`, `FLOWSMITH_ENGINE_API_KEY`
//! - `FLOWSMITH_WORKERS` (default 2)
//! - `FLOWSMITH_HTTP_TIMEOUT_SECS` (default 30)

use crate::engine_client::EngineClientConfig;
use crate::error::{PipelineError, Result};
use crate::llm::LlmClientConfig;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub llm: LlmClientConfig,
    pub engine: EngineClientConfig,
    pub workers: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let timeout_secs = optional("FLOWSMITH_HTTP_TIMEOUT_SECS")
            .map(|s| s.parse::<u64>())
            .transpose()
            .map_err(|e| PipelineError::Config(format!("bad FLOWSMITH_HTTP_TIMEOUT_SECS: {e}")))?
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let workers = optional("FLOWSMITH_WORKERS")
            .map(|s| s.parse::<usize>())
            .transpose()
            .map_err(|e| PipelineError::Config(format!("bad FLOWSMITH_WORKERS: {e}")))?
            .unwrap_or(DEFAULT_WORKERS);

        Ok(Self {
            llm: LlmClientConfig {
                base_url: required("FLOWSMITH_LLM_BASE_URL")?,
                api_key: required("FLOWSMITH_LLM_API_KEY")?,
                model: optional("FLOWSMITH_LLM_MODEL")
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout_secs,
            },
            engine: EngineClientConfig {
                base_url: required("FLOWSMITH_ENGINE_BASE_URL")?,
                api_key: required("FLOWSMITH_ENGINE_API_KEY")?,
                timeout_secs,
            },
            workers,
        })
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PipelineError::Config(format!("{key} is not set")))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
