//! Per-attachment processing state machine.
//!
//! `Start -> Downloading -> Classifying -> Relocating -> Cleanup`, with any
//! failing stage jumping straight to `ErrorHandling`. Each stage returns a
//! `Result`; the runner owns the [`PipelineState`] and moves it forward by
//! value, so no two runs can share one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use super::classifier::DocumentClassifier;
use super::types::{Attachment, ClassificationResult, DocumentType, ProcessingResult};
use crate::error::{MailboxError, PipelineError};
use crate::mailbox::Mailbox;
use crate::storage::StorageService;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Downloading,
    Classifying,
    Relocating,
    /// Terminal success.
    Cleanup,
    /// Terminal failure.
    ErrorHandling,
}

impl Stage {
    /// Strictly linear progress, plus a shared exit from every working stage.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Start, Downloading)
                | (Downloading, Classifying)
                | (Classifying, Relocating)
                | (Relocating, Cleanup)
                | (Downloading | Classifying | Relocating, ErrorHandling)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cleanup | Self::ErrorHandling)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Downloading => "downloading",
            Self::Classifying => "classifying",
            Self::Relocating => "relocating",
            Self::Cleanup => "cleanup",
            Self::ErrorHandling => "error_handling",
        };
        write!(f, "{s}")
    }
}

/// A recorded stage change.
#[derive(Debug, Clone, Serialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub timestamp: DateTime<Utc>,
}

/// Where the attachment's bytes come from.
#[derive(Debug, Clone)]
pub enum AttachmentOrigin {
    /// Download through the mailbox using the attachment's id.
    Mailbox { message_id: String },
    /// Bytes supplied directly, e.g. an HTTP upload.
    Upload { bytes: Vec<u8> },
}

/// State of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    run_id: Uuid,
    stage: Stage,
    attachment: Attachment,
    classification: Option<ClassificationResult>,
    destination_path: Option<PathBuf>,
    error: Option<String>,
    success: bool,
    transitions: Vec<StageTransition>,
}

impl PipelineState {
    pub fn new(attachment: Attachment) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: Stage::Start,
            attachment,
            classification: None,
            destination_path: None,
            error: None,
            success: false,
            transitions: Vec::new(),
        }
    }

    fn enter(mut self, next: Stage) -> Self {
        debug_assert!(
            self.stage.can_transition_to(next),
            "invalid stage transition {} -> {}",
            self.stage,
            next
        );
        tracing::info!(from = %self.stage, to = %next, "Stage transition");
        self.transitions.push(StageTransition {
            from: self.stage,
            to: next,
            timestamp: Utc::now(),
        });
        self.stage = next;
        self
    }

    fn downloaded(mut self, local_path: PathBuf) -> Self {
        self.attachment.local_path = Some(local_path);
        self
    }

    fn classified(mut self, classification: ClassificationResult) -> Self {
        self.classification = Some(classification);
        self
    }

    fn relocated(mut self, destination: PathBuf) -> Self {
        self.destination_path = Some(destination);
        self.success = true;
        self
    }

    fn failed(mut self, error: &PipelineError) -> Self {
        self.error = Some(error.to_string());
        self.success = false;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn classification(&self) -> Option<&ClassificationResult> {
        self.classification.as_ref()
    }

    pub fn destination_path(&self) -> Option<&Path> {
        self.destination_path.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    /// Convert the terminal state into the reported result.
    pub fn into_result(self) -> ProcessingResult {
        match (self.success, self.classification, self.destination_path) {
            (true, Some(classification), Some(destination)) => {
                ProcessingResult::succeeded(self.attachment.name, classification, &destination)
            }
            _ => ProcessingResult::failed(self.attachment.name, self.error.unwrap_or_default()),
        }
    }
}

/// The stage implementations and their collaborators.
pub struct Pipeline {
    storage: Arc<StorageService>,
    classifier: Arc<dyn DocumentClassifier>,
    mailbox: Option<Arc<dyn Mailbox>>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<StorageService>,
        classifier: Arc<dyn DocumentClassifier>,
        mailbox: Option<Arc<dyn Mailbox>>,
    ) -> Self {
        Self {
            storage,
            classifier,
            mailbox,
        }
    }

    /// Run one attachment to a terminal stage. Always returns a state with
    /// either `success` and a destination, or an error message.
    pub async fn run(&self, attachment: Attachment, origin: AttachmentOrigin) -> PipelineState {
        let state = PipelineState::new(attachment);
        let span = tracing::info_span!(
            "pipeline",
            run_id = %state.run_id,
            attachment = %state.attachment.name
        );
        self.drive(state, origin).instrument(span).await
    }

    async fn drive(&self, state: PipelineState, origin: AttachmentOrigin) -> PipelineState {
        let state = state.enter(Stage::Downloading);
        let local_path = match self.download(&state.attachment, origin).await {
            Ok(path) => path,
            Err(e) => return self.handle_error(state, e).await,
        };

        let state = state.downloaded(local_path.clone()).enter(Stage::Classifying);
        let classification = match self.classify(&local_path, &state.attachment.name).await {
            Ok(classification) => classification,
            Err(e) => return self.handle_error(state, e).await,
        };
        let document_type = classification.document_type();

        let state = state.classified(classification).enter(Stage::Relocating);
        let destination = match self
            .relocate(&local_path, &state.attachment.name, document_type)
            .await
        {
            Ok(destination) => destination,
            Err(e) => return self.handle_error(state, e).await,
        };

        let state = state.relocated(destination).enter(Stage::Cleanup);
        self.cleanup().await;
        state
    }

    async fn download(
        &self,
        attachment: &Attachment,
        origin: AttachmentOrigin,
    ) -> Result<PathBuf, PipelineError> {
        let bytes = match origin {
            AttachmentOrigin::Upload { bytes } => bytes,
            AttachmentOrigin::Mailbox { message_id } => {
                let mailbox = self.mailbox.as_ref().ok_or(MailboxError::NotConfigured)?;
                let attachment_id = attachment.attachment_id.as_deref().ok_or_else(|| {
                    PipelineError::Download(format!("attachment {} has no id", attachment.name))
                })?;
                mailbox.download_attachment(&message_id, attachment_id).await?
            }
        };

        let path = self
            .storage
            .write_temp_file(&attachment.name, &bytes)
            .await
            .map_err(|e| PipelineError::Download(e.to_string()))?;
        tracing::info!(path = %path.display(), size = bytes.len(), "Attachment downloaded");
        Ok(path)
    }

    async fn classify(
        &self,
        local_path: &Path,
        attachment_name: &str,
    ) -> Result<ClassificationResult, PipelineError> {
        if !tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            return Err(PipelineError::Classification(format!(
                "downloaded file {} is missing",
                local_path.display()
            )));
        }
        let classification = self.classifier.classify(local_path, attachment_name).await?;
        tracing::info!(
            document_type = %classification.document_type(),
            confidence = classification.confidence(),
            "Document classified"
        );
        Ok(classification)
    }

    async fn relocate(
        &self,
        local_path: &Path,
        attachment_name: &str,
        document_type: DocumentType,
    ) -> Result<PathBuf, PipelineError> {
        let destination = self
            .storage
            .move_to_destination(local_path, document_type, Some(attachment_name))
            .await?;
        Ok(destination)
    }

    /// Sweep stale temp files. Never affects the run's outcome.
    async fn cleanup(&self) {
        let max_age = self.storage.config().temp_max_age;
        if let Err(e) = self.storage.cleanup_temp_files(max_age).await {
            tracing::warn!(error = %e, "Temp cleanup failed");
        }
    }

    /// Record the failure and remove this run's temp file if it is still there.
    async fn handle_error(&self, state: PipelineState, error: PipelineError) -> PipelineState {
        tracing::error!(stage = %state.stage, error = %error, "Pipeline stage failed");
        let state = state.failed(&error).enter(Stage::ErrorHandling);

        if let Some(path) = &state.attachment.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed temp file after failure"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove temp file")
                }
            }
        }
        state
    }
}
