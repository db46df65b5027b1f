//! Mailbox collaborator: where attachments come from.

mod imap;

pub use imap::ImapMailbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;
use crate::pipeline::types::Attachment;

/// Metadata for one inbound message and its attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub attachments: Vec<Attachment>,
}

/// A source of messages with downloadable attachments.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Up to `max_count` of the most recent messages, newest first.
    async fn list_recent_messages(
        &self,
        max_count: usize,
        unread_only: bool,
    ) -> Result<Vec<EmailMessage>, MailboxError>;

    /// Raw bytes of one attachment.
    async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailboxError>;

    async fn mark_read(&self, message_id: &str) -> Result<(), MailboxError>;
}
