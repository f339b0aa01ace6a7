//! Bridges rig-core's `CompletionModel` to our [`LlmProvider`] trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Wraps any rig completion model.
///
/// Each request builds a throwaway agent: system messages become the
/// preamble and the last user message is the prompt.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .last_user_message()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: "request has no user message".into(),
            })?
            .to_string();

        let mut builder = AgentBuilder::new(self.model.clone());
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(&system);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        let content = agent.prompt(prompt).await.map_err(|e| {
            let reason = e.to_string();
            if reason.contains("401") || reason.to_lowercase().contains("unauthorized") {
                LlmError::AuthFailed {
                    provider: self.provider.to_string(),
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.provider.to_string(),
                    reason,
                }
            }
        })?;

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "empty completion".into(),
            });
        }

        Ok(CompletionResponse { content })
    }
}
