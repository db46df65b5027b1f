//! Bridge from rig-core completion models to [`LlmProvider`].

use std::time::Duration;

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role,
};

/// Wraps any rig completion model. Each request builds a one-shot agent
/// whose preamble is the request's system messages.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
    timeout: Duration,
}

impl<M> RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    pub fn new(model: M, model_name: &str, provider: &'static str, timeout: Duration) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
            timeout,
        }
    }

    fn request_failed(&self, reason: impl std::fmt::Display) -> LlmError {
        let reason = reason.to_string();
        let lowered = reason.to_lowercase();
        if lowered.contains("401") || lowered.contains("unauthorized") || lowered.contains("invalid api key") {
            LlmError::AuthFailed {
                provider: self.provider.to_string(),
            }
        } else {
            LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason,
            }
        }
    }
}

/// Split messages into the preamble (system) and the prompt (everything else).
///
/// A single trailing user turn is sent as-is; longer conversations are
/// rendered with role labels.
fn split_messages(messages: &[ChatMessage]) -> (String, String) {
    let preamble = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let prompt = match turns.as_slice() {
        [only] => only.content.clone(),
        many => many
            .iter()
            .map(|m| match m.role {
                Role::Assistant => format!("Assistant: {}", m.content),
                _ => format!("User: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    (preamble, prompt)
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
        let (preamble, prompt) = split_messages(&request.messages);
        if prompt.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "request has no user content".to_string(),
            });
        }

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&preamble);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        tracing::debug!(
            provider = self.provider,
            model = %self.model_name,
            prompt_chars = prompt.len(),
            "Sending completion request"
        );

        let content = tokio::time::timeout(self.timeout, agent.prompt(prompt.as_str()))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.provider.to_string(),
                after: self.timeout,
            })?
            .map_err(|e| self.request_failed(e))?;

        Ok(CompletionResponse { content })
    }
}
