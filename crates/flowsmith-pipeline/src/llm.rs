//! Generation backends.
//!
//! A [`LlmBackend`] turns a prompt plus retrieved context into a draft
//! workflow config. Several backends can run side by side; a
//! [`MergePolicy`] picks (or combines) the winning draft. The default
//! [`BestOf`] policy prefers drafts that already parse into a structurally
//! valid [`WorkflowConfig`].

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};
use crate::graph::WorkflowConfig;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// One backend's candidate output.
#[derive(Debug, Clone)]
pub struct LlmDraft {
    /// Which backend produced this draft.
    pub backend: String,
    /// Raw JSON text of the proposed workflow config.
    pub content: String,
}

/// A model backend capable of drafting a workflow config.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a draft for `prompt`, given the retrieved `context` block.
    async fn generate(&self, prompt: &str, context: &str) -> Result<LlmDraft>;
}

/// Chooses the final draft from one or more candidates.
pub trait MergePolicy: Send + Sync {
    fn merge(&self, drafts: Vec<LlmDraft>) -> Result<LlmDraft>;
}

// ---------------------------------------------------------------------------
// BestOf merge policy
// ---------------------------------------------------------------------------

/// Picks the draft most likely to survive validation: parseable configs
/// beat unparseable ones, and among equals the more detailed (longer)
/// draft wins.
#[derive(Debug, Default)]
pub struct BestOf;

impl MergePolicy for BestOf {
    fn merge(&self, drafts: Vec<LlmDraft>) -> Result<LlmDraft> {
        if drafts.is_empty() {
            return Err(PipelineError::External {
                reason: "no backend produced a draft".into(),
                retryable: false,
            });
        }

        let mut best: Option<(bool, usize, LlmDraft)> = None;
        for draft in drafts {
            let parses = serde_json::from_str::<Value>(&draft.content)
                .ok()
                .and_then(|v| WorkflowConfig::from_value(v).ok())
                .is_some();
            let len = draft.content.len();
            let better = match &best {
                None => true,
                Some((best_parses, best_len, _)) => {
                    (parses, len) > (*best_parses, *best_len)
                }
            };
            if better {
                best = Some((parses, len, draft));
            }
        }

        // best is Some: drafts was non-empty.
        let (parses, _, winner) = best.ok_or_else(|| PipelineError::External {
            reason: "no backend produced a draft".into(),
            retryable: false,
        })?;
        debug!(backend = %winner.backend, parses, "merge policy selected draft");
        Ok(winner)
    }
}

/// Takes the first draft as-is. Useful with a single trusted backend where
/// the extra parse pass of [`BestOf`] buys nothing.
#[derive(Debug, Default)]
pub struct FirstSuccess;

impl MergePolicy for FirstSuccess {
    fn merge(&self, mut drafts: Vec<LlmDraft>) -> Result<LlmDraft> {
        if drafts.is_empty() {
            return Err(PipelineError::External {
                reason: "no backend produced a draft".into(),
                retryable: false,
            });
        }
        Ok(drafts.remove(0))
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// Configuration for an OpenAI-compatible chat completions backend.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// Backend speaking the chat completions wire format.
pub struct HttpLlmBackend {
    client: reqwest::Client,
    config: LlmClientConfig,
}

const SYSTEM_PROMPT: &str = "You design workflow automation configurations. \
    Respond with a single JSON object containing name, trigger, nodes, edges \
    and settings. Reference credentials by alias only, never inline secrets.";

impl HttpLlmBackend {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(PipelineError::from)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, prompt, context), fields(model = %self.config.model))]
    async fn generate(&self, prompt: &str, context: &str) -> Result<LlmDraft> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!("{prompt}\n\nRelevant context:\n{context}")},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status.as_u16() == 429;
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::External {
                reason: format!("llm backend returned {status}: {text}"),
                retryable,
            });
        }

        let payload: Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::External {
                reason: "llm response missing message content".into(),
                retryable: false,
            })?
            .to_string();

        Ok(LlmDraft {
            backend: self.config.model.clone(),
            content,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config_text() -> String {
        json!({
            "name": "notifier",
            "trigger": {"kind": "webhook", "parameters": {}},
            "nodes": [
                {"id": "a", "node_type": "webhook", "label": "in", "parameters": {}},
            ],
            "edges": [],
            "settings": {},
        })
        .to_string()
    }

    fn draft(backend: &str, content: String) -> LlmDraft {
        LlmDraft {
            backend: backend.into(),
            content,
        }
    }

    #[test]
    fn best_of_prefers_parseable_draft() {
        let drafts = vec![
            draft("alpha", "this is not json at all, though it is quite long".into()),
            draft("beta", valid_config_text()),
        ];
        let winner = BestOf.merge(drafts).unwrap();
        assert_eq!(winner.backend, "beta");
    }

    #[test]
    fn best_of_breaks_ties_on_length() {
        let short = valid_config_text();
        let long = json!({
            "name": "notifier-with-error-handling",
            "trigger": {"kind": "webhook", "parameters": {"path": "/orders"}},
            "nodes": [
                {"id": "a", "node_type": "webhook", "label": "in", "parameters": {}},
                {"id": "b", "node_type": "slack-message", "label": "notify", "parameters": {}},
            ],
            "edges": [{"from": "a", "to": "b"}],
            "settings": {},
        })
        .to_string();

        let winner = BestOf
            .merge(vec![draft("short", short), draft("long", long)])
            .unwrap();
        assert_eq!(winner.backend, "long");
    }

    #[test]
    fn best_of_rejects_empty_input() {
        let result = BestOf.merge(vec![]);
        assert!(matches!(result, Err(PipelineError::External { .. })));
    }

    #[test]
    fn first_success_takes_the_first_draft() {
        let winner = FirstSuccess
            .merge(vec![draft("one", "{}".into()), draft("two", valid_config_text())])
            .unwrap();
        assert_eq!(winner.backend, "one");
    }
}
