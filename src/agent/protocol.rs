use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, Run, RunId, RunSpec, TaskId};
use crate::scheduler::RunReport;
use crate::status::RunStatus;

/// Host facts sent with every report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub hostname: String,
    pub cpus: u32,
    #[serde(default)]
    pub load_average: Option<f64>,
    /// Max runs the agent accepts at once.
    pub capacity: u32,
    /// Runs the agent is currently executing.
    pub running: u32,
}

impl NodeTelemetry {
    pub fn collect(capacity: u32, running: u32) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            hostname,
            cpus,
            load_average: read_load_average(),
            capacity,
            running,
        }
    }
}

fn read_load_average() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

/// Latest status of one run the agent knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub log_tail: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn into_report(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            status: self.status,
            exit_code: self.exit_code,
            reason: self.reason,
            log_lines: self.log_tail,
            observed_at: self.observed_at,
        }
    }
}

/// Periodic agent → controller call. Safe to repeat: every record carries
/// the latest known status, not a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub telemetry: NodeTelemetry,
    #[serde(default)]
    pub records: Vec<TaskRecord>,
}

/// A run the agent should start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAssignment {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub attempt: u32,
    pub spec: RunSpec,
}

impl From<&Run> for RunAssignment {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            task_id: run.task_id,
            job_id: run.job_id,
            attempt: run.attempt,
            spec: run.spec.clone(),
        }
    }
}

impl RunAssignment {
    /// The run as the agent tracks it locally.
    pub fn to_run(&self) -> Run {
        Run {
            id: self.run_id,
            task_id: self.task_id,
            job_id: self.job_id,
            attempt: self.attempt,
            spec: self.spec.clone(),
            status: RunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            log_tail: Vec::new(),
            log_pointer: None,
        }
    }
}

/// Controller → agent answer to a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDirective {
    /// Tasks whose runs must be stopped.
    #[serde(default)]
    pub cancel: Vec<TaskId>,
    /// Runs to start. May repeat runs already started; the agent ignores those.
    #[serde(default)]
    pub start: Vec<RunAssignment>,
    /// Terminal runs the controller has recorded; the agent may forget them.
    #[serde(default)]
    pub acknowledged: Vec<RunId>,
}
