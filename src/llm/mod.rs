//! Model access for document classification.
//!
//! [`create_provider`] turns an [`LlmConfig`] into a shared [`LlmProvider`].
//! Both backends go through rig-core and are wrapped in a [`RigAdapter`],
//! which applies the per-request timeout.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    /// Provider name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// Environment variable holding this backend's API key.
    pub fn api_key_var(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Model used when `LLM_MODEL` is not set.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Upper bound for a single completion call.
    pub request_timeout: Duration,
}

/// Create the classification model client.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let backend = config.backend;
    let key = config.api_key.expose_secret();

    let provider: Arc<dyn LlmProvider> = match backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
                backend.name(),
                config.request_timeout,
            ))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
                backend.name(),
                config.request_timeout,
            ))
        }
    };

    tracing::info!(
        provider = backend.name(),
        model = %config.model,
        timeout_secs = config.request_timeout.as_secs(),
        "Classification model ready"
    );
    Ok(provider)
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.name().to_string(),
        reason: format!("failed to create client: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: secrecy::SecretString::from("test-key"),
            model: backend.default_model().to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backends_name_their_key_and_default_model() {
        assert_eq!(LlmBackend::OpenAi.api_key_var(), "OPENAI_API_KEY");
        assert_eq!(LlmBackend::Anthropic.api_key_var(), "ANTHROPIC_API_KEY");
        assert_eq!(LlmBackend::OpenAi.default_model(), "gpt-4o");
        assert!(LlmBackend::Anthropic.default_model().starts_with("claude"));
    }

    #[test]
    fn providers_construct_offline_with_default_models() {
        // Keys are only checked when a request is made.
        for backend in [LlmBackend::Anthropic, LlmBackend::OpenAi] {
            let provider = create_provider(&config(backend)).unwrap();
            assert_eq!(provider.model_name(), backend.default_model());
        }
    }

    #[test]
    fn client_errors_name_the_backend() {
        let err = client_error(LlmBackend::Anthropic, "bad key format");
        assert_eq!(
            err.to_string(),
            "Provider anthropic request failed: failed to create client: bad key format"
        );
    }
}
