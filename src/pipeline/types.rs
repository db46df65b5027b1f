//! Core data types shared across the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification outcome for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    NonInvoice,
    /// Reserved for failures and ambiguous results.
    Unknown,
}

impl DocumentType {
    /// Case-insensitive mapping from a model label. Anything other than
    /// `invoice` or `non_invoice` is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "invoice" => Self::Invoice,
            "non_invoice" => Self::NonInvoice,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::NonInvoice => "non_invoice",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single file attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    pub content_type: String,
    /// Opaque mailbox handle; absent for direct uploads.
    pub attachment_id: Option<String>,
    /// Set only after a successful download.
    pub local_path: Option<PathBuf>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: content_type.into(),
            attachment_id: None,
            local_path: None,
        }
    }

    pub fn with_id(mut self, attachment_id: impl Into<String>) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self
    }
}

/// Structured classification of one document.
///
/// Constructed only through [`ClassificationResult::new`] so the confidence
/// is always within `[0.0, 1.0]` and `Unknown` always carries `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    document_type: DocumentType,
    confidence: f64,
    reasoning: String,
    metadata: Map<String, Value>,
}

impl ClassificationResult {
    pub fn new(
        document_type: DocumentType,
        confidence: f64,
        reasoning: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        let confidence = match document_type {
            DocumentType::Unknown => 0.0,
            _ if confidence.is_nan() => 0.0,
            _ => confidence.clamp(0.0, 1.0),
        };
        Self {
            document_type,
            confidence,
            reasoning: reasoning.into(),
            metadata,
        }
    }

    /// An `Unknown` result with zero confidence.
    pub fn unknown(reasoning: impl Into<String>) -> Self {
        Self::new(DocumentType::Unknown, 0.0, reasoning, Map::new())
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Final outcome reported for one attachment.
///
/// Either `success` with a non-empty `destination_path`, or not `success`
/// with a non-empty `error_message`. The constructors enforce this.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    attachment_name: String,
    classification: ClassificationResult,
    destination_path: String,
    success: bool,
    error_message: Option<String>,
    processed_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn succeeded(
        attachment_name: impl Into<String>,
        classification: ClassificationResult,
        destination: &Path,
    ) -> Self {
        Self {
            attachment_name: attachment_name.into(),
            classification,
            destination_path: destination.display().to_string(),
            success: true,
            error_message: None,
            processed_at: Utc::now(),
        }
    }

    /// A failed result. An empty message is replaced with "Unknown error".
    pub fn failed(attachment_name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            error
        };
        Self {
            attachment_name: attachment_name.into(),
            classification: ClassificationResult::unknown("Processing failed"),
            destination_path: String::new(),
            success: false,
            error_message: Some(error),
            processed_at: Utc::now(),
        }
    }

    /// Result for a run that faulted outside the stage machinery.
    pub fn workflow_fault(attachment_name: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut result = Self::failed(attachment_name, detail);
        result.classification = ClassificationResult::unknown("workflow exception");
        result
    }

    pub fn attachment_name(&self) -> &str {
        &self.attachment_name
    }

    pub fn classification(&self) -> &ClassificationResult {
        &self.classification
    }

    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }
}

/// Summary of one mailbox check.
#[derive(Debug, Clone, Serialize)]
pub struct EmailCheckReport {
    pub emails_processed: usize,
    pub attachments_processed: usize,
    pub results: Vec<ProcessingResult>,
    pub timestamp: DateTime<Utc>,
}
