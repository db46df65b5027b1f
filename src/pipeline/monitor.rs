//! Background mailbox monitor.
//!
//! Calls [`PipelineDriver::check_emails`] on a fixed interval for unread
//! messages until its shutdown flag is raised.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::driver::PipelineDriver;
use crate::config::MonitorConfig;

/// Spawn the monitor. Returns its `JoinHandle` and a shutdown flag.
///
/// The first check runs immediately. The flag is polled before every check,
/// so a check already in progress always completes.
pub fn spawn_mailbox_monitor(
    driver: Arc<PipelineDriver>,
    config: MonitorConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = config.check_interval.as_secs(),
            max_emails = config.max_emails_per_check,
            "Mailbox monitor started"
        );

        let mut tick = tokio::time::interval(config.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Mailbox monitor shutting down");
                return;
            }

            match driver.check_emails(config.max_emails_per_check, true).await {
                Ok(report) => info!(
                    emails = report.emails_processed,
                    attachments = report.attachments_processed,
                    "Scheduled email check finished"
                ),
                Err(e) => error!(error = %e, "Scheduled email check failed"),
            }
        }
    });

    (handle, shutdown_flag)
}
