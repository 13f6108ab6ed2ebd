use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{PlaneError, Result};
use crate::model::RunId;
use crate::status::RunStatus;

/// One backend observation about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub log_lines: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(run_id: RunId, status: RunStatus) -> Self {
        Self {
            run_id,
            status,
            exit_code: None,
            reason: None,
            log_lines: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_logs(mut self, lines: Vec<String>) -> Self {
        self.log_lines = lines;
        self
    }
}

/// Sending half of the channel through which backends report run status.
///
/// Cheap to clone; each started run holds one.
#[derive(Debug, Clone)]
pub struct ReportReceiver {
    tx: mpsc::Sender<RunReport>,
}

impl ReportReceiver {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<RunReport>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn deliver(&self, report: RunReport) -> Result<()> {
        self.tx.send(report).await.map_err(|e| {
            PlaneError::Infrastructure(format!(
                "report channel closed, dropped report for run {}",
                e.0.run_id
            ))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
