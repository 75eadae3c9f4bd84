//! Result reporting
//!
//! Posts the classified outcome of a job to the central server's jobs
//! endpoint, authenticated by the machine's secret and UUID. In offline mode
//! the payload is computed but not transmitted, so validator logic can be
//! exercised locally; the last payload stays available for inspection.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ExecutorConfig;

/// The fixed-field report posted for every finished job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPayload {
    #[serde(rename = "SubmissionFileId")]
    pub submission_file_id: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "MessageTutor")]
    pub message_tutor: String,
    #[serde(rename = "ExecutorDir")]
    pub executor_dir: String,
    #[serde(rename = "ErrorCode")]
    pub error_code: i32,
    #[serde(rename = "Secret")]
    pub secret: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// Outbound channel to the central server
pub struct Reporter {
    client: reqwest::Client,
    jobs_url: String,
    last_payload: Mutex<Option<ReportPayload>>,
}

impl Reporter {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Could not build HTTP client")?;

        Ok(Self {
            client,
            jobs_url: config.jobs_url(),
            last_payload: Mutex::new(None),
        })
    }

    /// Deliver one report. When `online` is false the payload is retained
    /// but never leaves the machine.
    pub async fn send(&self, payload: ReportPayload, online: bool) -> Result<()> {
        debug!(
            "Result for submission file {}: error code {}",
            payload.submission_file_id, payload.error_code
        );

        {
            let mut last = self.last_payload.lock().unwrap_or_else(|e| e.into_inner());
            *last = Some(payload.clone());
        }

        if !online {
            info!("Offline mode, result not transmitted");
            return Ok(());
        }

        self.client
            .post(&self.jobs_url)
            .form(&payload)
            .send()
            .await
            .context("Could not reach the result endpoint")?
            .error_for_status()
            .context("Result endpoint rejected the report")?;

        info!(
            "Result for submission file {} delivered",
            payload.submission_file_id
        );
        Ok(())
    }

    /// The most recently computed payload, transmitted or not
    pub fn last_payload(&self) -> Option<ReportPayload> {
        self.last_payload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
