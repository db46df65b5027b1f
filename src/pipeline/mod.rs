//! Per-attachment processing pipeline.
//!
//! download -> classify -> relocate -> cleanup, with a shared error exit.
//! The [`PipelineDriver`] fans out over attachments and always reports one
//! [`ProcessingResult`] per attachment.

pub mod classifier;
pub mod driver;
pub mod monitor;
pub mod parser;
pub mod types;
pub mod workflow;

pub use classifier::{DocumentClassifier, LlmClassifier};
pub use driver::PipelineDriver;
pub use monitor::spawn_mailbox_monitor;
pub use parser::parse_classification;
pub use types::{Attachment, ClassificationResult, DocumentType, EmailCheckReport, ProcessingResult};
pub use workflow::{AttachmentOrigin, Pipeline, PipelineState, Stage};
