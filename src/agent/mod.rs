//! The execution agent.
//!
//! An agent runs on a host with a container engine. Every report interval
//! it sends the latest status of each run it knows to the controller and
//! applies the answer: start new runs, stop canceled ones, forget the ones
//! the controller has recorded. Runs move through a local transition
//! pipeline (`received` → `running` → `finished`) checkpointed to disk, so a
//! restarted agent picks up where it left off and never starts a run twice.

pub mod client;
pub mod protocol;
pub mod transitions;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::model::RunId;
use crate::pipeline::{CheckpointStore, FileCheckpointStore, ListName, Pipeline, TickReport, WorkItem};
use crate::plane::CancelSet;
use crate::scheduler::{DockerExecutor, ReportReceiver, RunExecutor, RunReport};
use crate::status::{Lifecycle, RunStatus};

pub use client::{ControlPlane, HttpControlPlane};
pub use protocol::{AgentDirective, AgentReport, NodeTelemetry, RunAssignment, TaskRecord};
use transitions::{ForgetRun, SettleRun, StartRun, StopRun};

pub const RECEIVED: ListName = "received";
pub const RUNNING: ListName = "running";
pub const FINISHED: ListName = "finished";

const LOG_TAIL_LINES: usize = 50;

/// A run as the agent tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub assignment: RunAssignment,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub log_tail: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(assignment: RunAssignment) -> Self {
        Self {
            assignment,
            status: RunStatus::Created,
            exit_code: None,
            reason: None,
            log_tail: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Take over a terminal observation.
    pub fn settle(&mut self, report: &RunReport) {
        self.status = report.status;
        self.exit_code = report.exit_code.or(self.exit_code);
        if report.reason.is_some() {
            self.reason = report.reason.clone();
        }
        if !report.log_lines.is_empty() {
            self.log_tail = report.log_lines.clone();
        }
        self.updated_at = report.observed_at;
    }
}

impl WorkItem for AgentTask {
    fn key(&self) -> Uuid {
        self.assignment.run_id
    }
}

/// Latest engine observation per run, fed by the executor's monitors.
#[derive(Debug, Default)]
pub struct Observations {
    latest: Mutex<HashMap<RunId, RunReport>>,
}

impl Observations {
    /// Merge a report. Stale statuses are dropped; log lines accumulate.
    pub fn record(&self, report: RunReport) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        match latest.get_mut(&report.run_id) {
            Some(current) => {
                let newer = current.status == report.status
                    || current.status.can_transition_to(report.status);
                if !newer {
                    return;
                }
                current.status = report.status;
                current.observed_at = report.observed_at;
                current.exit_code = report.exit_code.or(current.exit_code);
                if report.reason.is_some() {
                    current.reason = report.reason;
                }
                current.log_lines.extend(report.log_lines);
                if current.log_lines.len() > LOG_TAIL_LINES {
                    let excess = current.log_lines.len() - LOG_TAIL_LINES;
                    current.log_lines.drain(..excess);
                }
            }
            None => {
                latest.insert(report.run_id, report);
            }
        }
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunReport> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    pub fn forget(&self, run_id: &RunId) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }
}

/// Handles the agent's transitions work with.
#[derive(Clone)]
pub struct AgentContext {
    pub executor: Arc<dyn RunExecutor>,
    pub reports: ReportReceiver,
    pub observations: Arc<Observations>,
    pub cancels: Arc<CancelSet>,
    acknowledged: Arc<Mutex<HashSet<RunId>>>,
}

impl AgentContext {
    pub fn is_acknowledged(&self, run_id: &RunId) -> bool {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run_id)
    }

    fn acknowledge(&self, run_id: RunId) {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id);
    }

    pub fn clear_acknowledged(&self, run_id: &RunId) {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }
}

pub struct Agent {
    config: AgentConfig,
    control: Arc<dyn ControlPlane>,
    ctx: AgentContext,
    pipeline: Pipeline<AgentTask, AgentContext>,
    local_rx: AsyncMutex<mpsc::Receiver<RunReport>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        executor: Arc<dyn RunExecutor>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (reports, local_rx) = ReportReceiver::channel(256);
        let ctx = AgentContext {
            executor,
            reports,
            observations: Arc::new(Observations::default()),
            cancels: Arc::new(CancelSet::new()),
            acknowledged: Arc::new(Mutex::new(HashSet::new())),
        };
        let pipeline = Pipeline::new("agent", &[RECEIVED, RUNNING, FINISHED], store)
            .with_transition(StopRun)
            .with_transition(SettleRun)
            .with_transition(StartRun)
            .with_transition(ForgetRun);
        Self {
            config,
            control,
            ctx,
            pipeline,
            local_rx: AsyncMutex::new(local_rx),
        }
    }

    /// An agent on the local Docker engine reporting over HTTP, with
    /// checkpoints under the configured directory.
    pub async fn open(config: AgentConfig) -> Result<Self> {
        let control = Arc::new(HttpControlPlane::new(&config.controller_url)?);
        let executor = Arc::new(DockerExecutor::new(config.docker.clone()));
        let store = Arc::new(FileCheckpointStore::open(&config.checkpoint_dir).await?);
        Ok(Self::new(config, control, executor, store))
    }

    pub fn id(&self) -> &str {
        &self.config.agent_id
    }

    /// Rebuild the local pipeline and re-attach to runs that were in flight.
    pub async fn recover(&self) -> Result<usize> {
        let restored = self.pipeline.recover().await?;
        let running: Vec<AgentTask> = self.pipeline.lists().lock().await.get(RUNNING).to_vec();
        for task in running {
            let run = task.assignment.to_run();
            match self.ctx.executor.attach(&run, self.ctx.reports.clone()).await {
                Ok(Some(())) => {
                    tracing::info!(run_id = %run.id, "Re-attached to run");
                }
                Ok(None) => {
                    tracing::warn!(run_id = %run.id, "Run vanished while the agent was down");
                    self.ctx.observations.record(
                        RunReport::new(run.id, RunStatus::NoSuchContainer)
                            .with_reason("container vanished while the agent was down"),
                    );
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "Re-attach failed");
                }
            }
        }
        Ok(restored)
    }

    fn drain_local(&self, rx: &mut mpsc::Receiver<RunReport>) -> usize {
        let mut drained = 0;
        while let Ok(report) = rx.try_recv() {
            self.ctx.observations.record(report);
            drained += 1;
        }
        drained
    }

    /// Latest status of every run the agent holds.
    pub async fn records(&self) -> Vec<TaskRecord> {
        let entries = self.pipeline.lists().lock().await.entries();
        entries
            .into_iter()
            .map(|(list, task)| {
                let observed = self.ctx.observations.get(&task.assignment.run_id);
                let (status, exit_code, reason, log_tail, observed_at) = match observed {
                    Some(report) if list != FINISHED => (
                        report.status,
                        report.exit_code,
                        report.reason,
                        report.log_lines,
                        report.observed_at,
                    ),
                    _ => (
                        task.status,
                        task.exit_code,
                        task.reason.clone(),
                        task.log_tail.clone(),
                        task.updated_at,
                    ),
                };
                TaskRecord {
                    run_id: task.assignment.run_id,
                    task_id: task.assignment.task_id,
                    status,
                    exit_code,
                    reason,
                    log_tail,
                    observed_at,
                }
            })
            .collect()
    }

    pub async fn build_report(&self) -> AgentReport {
        let records = self.records().await;
        let running = records.iter().filter(|r| !r.status.is_terminal()).count() as u32;
        AgentReport {
            agent_id: self.config.agent_id.clone(),
            labels: self.config.labels.clone(),
            telemetry: NodeTelemetry::collect(self.config.capacity, running),
            records,
        }
    }

    async fn apply_directive(&self, directive: &AgentDirective) -> Result<()> {
        for run_id in &directive.acknowledged {
            self.ctx.acknowledge(*run_id);
        }
        let known_tasks: HashSet<_> = self
            .pipeline
            .lists()
            .lock()
            .await
            .entries()
            .into_iter()
            .filter(|(list, _)| *list != FINISHED)
            .map(|(_, task)| task.assignment.task_id)
            .collect();
        for task_id in &directive.cancel {
            if known_tasks.contains(task_id) {
                self.ctx.cancels.mark(*task_id);
            }
        }
        for assignment in &directive.start {
            if self
                .pipeline
                .admit(RECEIVED, AgentTask::new(assignment.clone()))
                .await?
            {
                tracing::info!(run_id = %assignment.run_id, "Run received");
            }
        }
        Ok(())
    }

    /// One report round trip followed by a local tick.
    pub async fn cycle(&self) -> Result<TickReport> {
        {
            let mut rx = self.local_rx.lock().await;
            self.drain_local(&mut rx);
        }
        let report = self.build_report().await;
        let directive = self.control.report(report).await?;
        self.apply_directive(&directive).await?;
        let ticked = self.pipeline.tick(&self.ctx).await?;
        let mut rx = self.local_rx.lock().await;
        self.drain_local(&mut rx);
        Ok(ticked)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.report_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(agent_id = %self.config.agent_id, "Agent loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        tracing::warn!(agent_id = %self.config.agent_id, error = %e, "Agent cycle failed");
                    }
                }
            }
        }
    }
}
