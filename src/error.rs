//! Error types for the invoice agent.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Mailbox collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox is not configured")]
    NotConfigured,

    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Attachment {attachment_id} not found in message {message_id}")]
    AttachmentNotFound {
        message_id: String,
        attachment_id: String,
    },

    #[error("Attachment {0} has no content")]
    EmptyAttachment(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Source file {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline failures, one per stage plus the workflow fault.
///
/// The `Display` output is what callers see as `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Move failed: {0}")]
    Relocation(String),

    #[error("Workflow exception: {0}")]
    WorkflowFault(String),
}

impl From<MailboxError> for PipelineError {
    fn from(e: MailboxError) -> Self {
        Self::Download(e.to_string())
    }
}

impl From<StorageError> for PipelineError {
    fn from(e: StorageError) -> Self {
        Self::Relocation(e.to_string())
    }
}
