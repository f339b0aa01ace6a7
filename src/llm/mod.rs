//! Model access for order extraction.
//!
//! The extractor only sees [`LlmProvider`]. [`create_provider`] picks the
//! rig-core client for the configured backend and wraps its completion model
//! in a [`RigAdapter`].

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::config::AppConfig;
use crate::error::{ConfigError, LlmError};

/// Which hosted model family answers extraction requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmBackend {
    #[default]
    OpenAi,
    Anthropic,
}

impl LlmBackend {
    /// Environment variable holding this backend's API key.
    pub fn key_var(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(ConfigError::InvalidValue {
                key: "LLM_BACKEND".into(),
                message: format!("unknown backend '{other}' (expected openai or anthropic)"),
            }),
        }
    }
}

/// Model settings for extraction.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Key read from [`LlmBackend::key_var`].
    pub api_key: SecretString,
    /// Model id, from `OPENAI_MODEL` whatever the backend.
    pub model: String,
}

impl LlmConfig {
    /// Refuse to start a run without a key or a model id.
    pub fn check_ready(&self) -> Result<(), ConfigError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::MissingEnvVar(self.backend.key_var().into()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("OPENAI_MODEL".into()));
        }
        Ok(())
    }
}

/// Build the extraction model for `config`.
pub fn create_provider(config: &AppConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let llm = &config.llm;
    let key = llm.api_key.expose_secret();
    let client_error = |e: &dyn fmt::Display| LlmError::RequestFailed {
        provider: llm.backend.name().to_string(),
        reason: format!("could not build client: {e}"),
    };

    let provider: Arc<dyn LlmProvider> = match llm.backend {
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(&e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&llm.model),
                &llm.model,
                llm.backend.name(),
            ))
        }
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(&e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&llm.model),
                &llm.model,
                llm.backend.name(),
            ))
        }
    };

    tracing::info!(backend = %llm.backend, model = %llm.model, "Extraction model ready");
    Ok(provider)
}
