use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{BackendKind, ExecOutput, ReportReceiver, RunExecutor, RunReport};
use crate::agent::protocol::{AgentDirective, AgentReport, NodeTelemetry, RunAssignment};
use crate::error::{PlaneError, Result};
use crate::model::{Run, RunId, TaskId};
use crate::status::{Lifecycle, RunStatus};

/// Liveness and load of one registered agent.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub telemetry: NodeTelemetry,
    pub last_seen: Instant,
    pub runs: HashSet<RunId>,
}

impl AgentState {
    fn new(id: String) -> Self {
        Self {
            id,
            labels: BTreeMap::new(),
            telemetry: NodeTelemetry::default(),
            last_seen: Instant::now(),
            runs: HashSet::new(),
        }
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }

    fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|l| l == v))
    }

    fn has_room(&self) -> bool {
        self.runs.len() < self.telemetry.capacity as usize
    }
}

/// Snapshot of an agent for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub telemetry: NodeTelemetry,
    pub runs: usize,
    pub last_seen_ms: u64,
}

#[derive(Debug)]
struct Placement {
    agent_id: String,
    assignment: RunAssignment,
    /// The agent has reported on this run at least once.
    seen: bool,
    /// Removed by the plane while a stop was still pending. Dropped as soon
    /// as the agent reports the run terminal.
    detached: bool,
}

#[derive(Debug, Default)]
struct HubState {
    agents: HashMap<String, AgentState>,
    queued: VecDeque<RunAssignment>,
    placements: HashMap<RunId, Placement>,
    receivers: HashMap<RunId, ReportReceiver>,
    /// Outstanding stop requests, kept until the agent reports the run terminal.
    cancels: HashMap<TaskId, RunId>,
    last_status: HashMap<RunId, RunStatus>,
}

impl HubState {
    fn place(&mut self, run_id: RunId, agent_id: &str) {
        let Some(pos) = self.queued.iter().position(|a| a.run_id == run_id) else {
            return;
        };
        if let Some(assignment) = self.queued.remove(pos) {
            self.assign(assignment, agent_id);
        }
    }

    fn assign(&mut self, assignment: RunAssignment, agent_id: &str) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.runs.insert(assignment.run_id);
        }
        tracing::info!(run_id = %assignment.run_id, agent_id, "Run placed on agent");
        self.placements.insert(
            assignment.run_id,
            Placement {
                agent_id: agent_id.to_string(),
                assignment,
                seen: false,
                detached: false,
            },
        );
    }

    fn release(&mut self, run_id: &RunId) {
        if let Some(placement) = self.placements.get(run_id) {
            if let Some(agent) = self.agents.get_mut(&placement.agent_id) {
                agent.runs.remove(run_id);
            }
        }
    }
}

/// Backend for runs executed by remote agents.
///
/// Agents pull work: `run` only queues an assignment, and the next report
/// from a matching agent with spare capacity picks it up. Everything the
/// agents observe flows back through [`AgentHub::handle_report`].
#[derive(Debug)]
pub struct AgentHub {
    state: Mutex<HubState>,
    agent_timeout: Duration,
}

impl AgentHub {
    pub fn new(agent_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            agent_timeout,
        }
    }

    /// Apply one agent report and compute the agent's instructions.
    ///
    /// Repeating a report is harmless: records are latest-status snapshots,
    /// already-placed runs are re-sent until the agent reports them, and
    /// terminal runs are acknowledged every time they are seen.
    pub async fn handle_report(&self, report: AgentReport) -> AgentDirective {
        let mut forward: Vec<(ReportReceiver, RunReport)> = Vec::new();
        let mut directive = AgentDirective::default();
        {
            let mut state = self.state.lock().await;
            let agent_id = report.agent_id.clone();
            let agent = state.agents.entry(agent_id.clone()).or_insert_with(|| {
                tracing::info!(agent_id = %agent_id, "Agent registered");
                AgentState::new(agent_id.clone())
            });
            agent.last_seen = Instant::now();
            agent.labels = report.labels.clone();
            agent.telemetry = report.telemetry.clone();

            for record in report.records {
                let run_id = record.run_id;
                let status = record.status;
                state.place(run_id, &agent_id);
                let known = state.placements.contains_key(&run_id);

                if let Some(placement) = state.placements.get_mut(&run_id) {
                    placement.seen = true;
                }
                state.last_status.insert(run_id, status);
                if let Some(receiver) = state.receivers.get(&run_id) {
                    forward.push((receiver.clone(), record.clone().into_report()));
                }

                if status.is_terminal() {
                    state.cancels.remove(&record.task_id);
                    state.release(&run_id);
                    if state.placements.get(&run_id).is_some_and(|p| p.detached) {
                        tracing::debug!(run_id = %run_id, agent_id = %agent_id, "Agent confirmed stop");
                        state.placements.remove(&run_id);
                        state.last_status.remove(&run_id);
                    }
                    directive.acknowledged.push(run_id);
                } else if !known {
                    // not ours (or long forgotten): stop it
                    tracing::warn!(run_id = %run_id, agent_id = %agent_id, "Agent reports unknown run");
                    directive.cancel.push(record.task_id);
                }
            }

            for (task_id, run_id) in &state.cancels {
                if state
                    .placements
                    .get(run_id)
                    .is_some_and(|p| p.agent_id == agent_id)
                {
                    directive.cancel.push(*task_id);
                }
            }

            for placement in state.placements.values() {
                let terminal = state
                    .last_status
                    .get(&placement.assignment.run_id)
                    .is_some_and(|s| s.is_terminal());
                if placement.agent_id == agent_id
                    && !placement.seen
                    && !placement.detached
                    && !terminal
                {
                    directive.start.push(placement.assignment.clone());
                }
            }

            let mut remaining = VecDeque::new();
            while let Some(assignment) = state.queued.pop_front() {
                let fits = state.agents.get(&agent_id).is_some_and(|a| {
                    a.has_room() && a.matches(&assignment.spec.node_selector)
                });
                if fits {
                    directive.start.push(assignment.clone());
                    state.assign(assignment, &agent_id);
                } else {
                    remaining.push_back(assignment);
                }
            }
            state.queued = remaining;
        }

        for (receiver, report) in forward {
            if let Err(e) = receiver.deliver(report).await {
                tracing::warn!(error = %e, "Dropping agent record");
            }
        }
        directive
    }

    /// Forget agents that stopped reporting. Their unfinished runs are
    /// reported as failed.
    pub async fn reap_dead_agents(&self) -> Vec<String> {
        let mut forward = Vec::new();
        let dead: Vec<String> = {
            let mut state = self.state.lock().await;
            let dead: Vec<String> = state
                .agents
                .values()
                .filter(|a| !a.is_alive(self.agent_timeout))
                .map(|a| a.id.clone())
                .collect();
            for agent_id in &dead {
                let Some(agent) = state.agents.remove(agent_id) else {
                    continue;
                };
                tracing::warn!(agent_id = %agent_id, runs = agent.runs.len(), "Agent timed out");
                for run_id in agent.runs {
                    state.placements.remove(&run_id);
                    state.cancels.retain(|_, pending| *pending != run_id);
                    let already_final = state
                        .last_status
                        .get(&run_id)
                        .is_some_and(|s| s.is_terminal());
                    if already_final {
                        continue;
                    }
                    state.last_status.insert(run_id, RunStatus::Fail);
                    if let Some(receiver) = state.receivers.get(&run_id) {
                        forward.push((
                            receiver.clone(),
                            RunReport::new(run_id, RunStatus::Fail)
                                .with_reason(format!("agent {} stopped reporting", agent_id)),
                        ));
                    }
                }
            }
            dead
        };
        for (receiver, report) in forward {
            if let Err(e) = receiver.deliver(report).await {
                tracing::warn!(error = %e, "Dropping agent failure report");
            }
        }
        dead
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        let state = self.state.lock().await;
        let mut agents: Vec<AgentInfo> = state
            .agents
            .values()
            .map(|a| AgentInfo {
                id: a.id.clone(),
                labels: a.labels.clone(),
                telemetry: a.telemetry.clone(),
                runs: a.runs.len(),
                last_seen_ms: a.last_seen.elapsed().as_millis() as u64,
            })
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    /// Stop requests not yet confirmed by an agent.
    pub async fn pending_stops(&self) -> usize {
        self.state.lock().await.cancels.len()
    }
}

#[async_trait]
impl RunExecutor for AgentHub {
    fn kind(&self) -> BackendKind {
        BackendKind::Agent
    }

    async fn run(&self, run: &Run, reports: ReportReceiver) -> Result<()> {
        let mut state = self.state.lock().await;
        state.receivers.insert(run.id, reports);
        let pending = state.placements.contains_key(&run.id)
            || state.queued.iter().any(|a| a.run_id == run.id);
        if !pending {
            tracing::debug!(run_id = %run.id, "Run queued for agents");
            state.queued.push_back(RunAssignment::from(run));
        }
        Ok(())
    }

    async fn attach(&self, run: &Run, reports: ReportReceiver) -> Result<Option<()>> {
        let mut state = self.state.lock().await;
        let known = state.placements.contains_key(&run.id)
            || state.queued.iter().any(|a| a.run_id == run.id);
        if !known {
            return Ok(None);
        }
        state.receivers.insert(run.id, reports);
        Ok(Some(()))
    }

    async fn stop(&self, run: &Run) -> Result<Option<()>> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.queued.iter().position(|a| a.run_id == run.id) {
            state.queued.remove(pos);
            return Ok(Some(()));
        }
        if !state.placements.contains_key(&run.id) {
            return Ok(None);
        }
        let finished = state
            .last_status
            .get(&run.id)
            .is_some_and(|s| s.is_terminal());
        if !finished {
            state.cancels.insert(run.task_id, run.id);
        }
        Ok(Some(()))
    }

    async fn remove(&self, run: &Run) -> Result<Option<()>> {
        let mut state = self.state.lock().await;
        state.receivers.remove(&run.id);
        let stopping = state.cancels.get(&run.task_id) == Some(&run.id);
        // keep the placement so the stop keeps reaching the agent
        if stopping {
            if let Some(placement) = state.placements.get_mut(&run.id) {
                if placement.seen {
                    placement.detached = true;
                    return Ok(Some(()));
                }
            }
            state.cancels.remove(&run.task_id);
        }
        state.release(&run.id);
        state.last_status.remove(&run.id);
        Ok(state.placements.remove(&run.id).map(|_| ()))
    }

    async fn exec(&self, run: &Run, _command: &[String]) -> Result<Option<ExecOutput>> {
        Err(PlaneError::Backend(format!(
            "exec is not available for agent-hosted run {}",
            run.id
        )))
    }

    async fn probe(&self, run: &Run) -> Result<Option<RunStatus>> {
        let state = self.state.lock().await;
        if let Some(status) = state.last_status.get(&run.id) {
            return Ok(Some(*status));
        }
        let pending = state.placements.contains_key(&run.id)
            || state.queued.iter().any(|a| a.run_id == run.id);
        Ok(pending.then_some(RunStatus::Created))
    }
}
