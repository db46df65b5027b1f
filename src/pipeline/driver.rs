//! Runs the pipeline once per attachment and reports a result for each.
//!
//! Every run executes on its own task. A panic inside a run becomes a failed
//! result for that attachment only; nothing here propagates past the driver
//! except a failure to list the mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::{FutureExt, StreamExt, future, stream};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use super::types::{Attachment, EmailCheckReport, ProcessingResult};
use super::workflow::{AttachmentOrigin, Pipeline};
use crate::error::{MailboxError, PipelineError};
use crate::mailbox::{EmailMessage, Mailbox};

/// Batch front-end over [`Pipeline`].
pub struct PipelineDriver {
    pipeline: Arc<Pipeline>,
    mailbox: Option<Arc<dyn Mailbox>>,
    max_concurrent_runs: usize,
    shutdown: Arc<AtomicBool>,
}

impl PipelineDriver {
    pub fn new(
        pipeline: Arc<Pipeline>,
        mailbox: Option<Arc<dyn Mailbox>>,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            pipeline,
            mailbox,
            max_concurrent_runs: max_concurrent_runs.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set this flag to stop launching new runs. Runs already started finish.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn has_mailbox(&self) -> bool {
        self.mailbox.is_some()
    }

    /// Process one mailbox attachment end to end.
    pub async fn process(&self, email: &EmailMessage, attachment: &Attachment) -> ProcessingResult {
        let origin = AttachmentOrigin::Mailbox {
            message_id: email.id.clone(),
        };
        self.run_isolated(attachment.clone(), origin).await
    }

    /// Process directly uploaded bytes end to end.
    pub async fn process_upload(&self, name: &str, bytes: Vec<u8>) -> ProcessingResult {
        let attachment = Attachment::new(name, bytes.len() as u64, "application/octet-stream");
        self.run_isolated(attachment, AttachmentOrigin::Upload { bytes })
            .await
    }

    async fn run_isolated(&self, attachment: Attachment, origin: AttachmentOrigin) -> ProcessingResult {
        let name = attachment.name.clone();
        let pipeline = Arc::clone(&self.pipeline);

        let result = match tokio::spawn(async move { pipeline.run(attachment, origin).await }).await
        {
            Ok(state) => state.into_result(),
            Err(join_error) => {
                let fault = PipelineError::WorkflowFault(join_error_message(join_error));
                error!(attachment = %name, error = %fault, "Pipeline run faulted");
                ProcessingResult::workflow_fault(&name, fault.to_string())
            }
        };

        if result.success() {
            info!(
                attachment = %name,
                destination = result.destination_path(),
                document_type = %result.classification().document_type(),
                confidence = result.classification().confidence(),
                "Attachment processed"
            );
        } else {
            warn!(
                attachment = %name,
                error = result.error_message().unwrap_or_default(),
                "Attachment processing failed"
            );
        }
        result
    }

    /// List recent messages and process every attachment.
    ///
    /// Results keep attachment order. A message is marked read once each of
    /// its attachments has a result; messages without attachments are left
    /// alone.
    pub async fn check_emails(
        &self,
        max_emails: usize,
        unread_only: bool,
    ) -> Result<EmailCheckReport, MailboxError> {
        let mailbox = self.mailbox.as_ref().ok_or(MailboxError::NotConfigured)?;
        let emails = mailbox.list_recent_messages(max_emails, unread_only).await?;
        info!(count = emails.len(), unread_only, "Checking emails");

        let jobs: Vec<(String, Attachment)> = emails
            .iter()
            .filter(|email| {
                if email.attachments.is_empty() {
                    info!(message_id = %email.id, "Skipping message without attachments");
                }
                !email.attachments.is_empty()
            })
            .flat_map(|email| {
                email
                    .attachments
                    .iter()
                    .map(|attachment| (email.id.clone(), attachment.clone()))
            })
            .collect();

        let shutdown = Arc::clone(&self.shutdown);
        let outcomes: Vec<(String, ProcessingResult)> = stream::iter(jobs)
            .take_while(move |_| future::ready(!shutdown.load(Ordering::SeqCst)))
            .map(|(message_id, attachment)| {
                let origin = AttachmentOrigin::Mailbox {
                    message_id: message_id.clone(),
                };
                self.run_isolated(attachment, origin)
                    .map(move |result| (message_id, result))
            })
            .buffered(self.max_concurrent_runs)
            .collect()
            .await;

        let mut finished: HashMap<String, usize> = HashMap::new();
        for (message_id, _) in &outcomes {
            *finished.entry(message_id.clone()).or_default() += 1;
        }
        for email in &emails {
            let done = finished.get(&email.id).copied().unwrap_or(0);
            if email.attachments.is_empty() || done < email.attachments.len() {
                continue;
            }
            if let Err(e) = mailbox.mark_read(&email.id).await {
                warn!(message_id = %email.id, error = %e, "Failed to mark message as read");
            }
        }

        let results: Vec<ProcessingResult> = outcomes.into_iter().map(|(_, r)| r).collect();
        info!(
            emails = emails.len(),
            attachments = results.len(),
            succeeded = results.iter().filter(|r| r.success()).count(),
            "Email check complete"
        );

        Ok(EmailCheckReport {
            emails_processed: emails.len(),
            attachments_processed: results.len(),
            results,
            timestamp: Utc::now(),
        })
    }
}

fn join_error_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "pipeline task panicked".to_string())
}
