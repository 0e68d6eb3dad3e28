//! Completion notification.
//!
//! Delivery (e-mail) belongs to the surrounding application; the shipped
//! notifier records the event in the log.

use std::sync::Mutex;

use async_trait::async_trait;

use super::report::RunReport;
use super::traits::CompletionNotifier;

pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, address: &str, report: &RunReport) -> Result<(), String> {
        tracing::info!(
            run_id = %report.run_id,
            subject_id = %report.subject_id,
            address,
            findings = report.key_findings.len(),
            "Analysis completion notification"
        );
        Ok(())
    }
}

/// Keeps (address, run id) pairs in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, address: &str, report: &RunReport) -> Result<(), String> {
        self.sent
            .lock()
            .map_err(|_| "notifier lock poisoned".to_string())?
            .push((address.to_string(), report.run_id.clone()));
        Ok(())
    }
}
