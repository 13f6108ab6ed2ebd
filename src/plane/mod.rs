//! The controller.
//!
//! A [`Plane`] owns the unit store and drives two transition pipelines:
//!
//! - `steps` (`waiting` → `active` → out): triggers a step once its
//!   predecessor succeeded and admits its tasks to the task pipeline.
//! - `tasks` (`due` → `launched` → out): launches runs on the pool's backend,
//!   relaunches retried attempts, cancels and releases.
//!
//! Backend observations arrive on a report channel and are applied at the
//! start and end of every tick, in receipt order.

pub mod context;
pub mod reports;
pub mod steps;
pub mod tasks;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::protocol::{AgentDirective, AgentReport};
use crate::config::PlaneConfig;
use crate::error::{PlaneError, Result};
use crate::model::{Job, JobDetail, JobId, JobSpec, StepId, TaskId, UnitStore};
use crate::pipeline::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, Pipeline, TickReport};
use crate::pool::PoolRegistry;
use crate::propagate::{Propagation, Propagator};
use crate::scheduler::{
    AgentHub, BackendRegistry, DockerExecutor, ExecOutput, KubernetesExecutor, ReportReceiver,
    RunExecutor, RunReport,
};
use crate::status::{JobStatus, Lifecycle, RunStatus, StepStatus, TaskStatus};

pub use context::{
    CancelSet, PlaneContext, StepContext, StepWork, TaskWork, ACTIVE, DUE, LAUNCHED, WAITING,
};
use context::{STEP_LISTS, TASK_LISTS};
use steps::{RetireStep, TriggerStep};
use tasks::{CancelTask, FinishTask, LaunchTask, RelaunchTask};

/// What one controller tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reports: usize,
    pub timed_out: usize,
    pub steps: TickReport,
    pub tasks: TickReport,
    pub archived: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        *self == TickSummary::default()
    }
}

/// Explicit wiring for a [`Plane`]. Anything not set gets an in-memory
/// default.
pub struct PlaneBuilder {
    config: PlaneConfig,
    units: Option<Arc<RwLock<UnitStore>>>,
    pools: Option<Arc<PoolRegistry>>,
    backends: BackendRegistry,
    hub: Option<Arc<AgentHub>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl PlaneBuilder {
    pub fn units(mut self, units: Arc<RwLock<UnitStore>>) -> Self {
        self.units = Some(units);
        self
    }

    pub fn pools(mut self, pools: Arc<PoolRegistry>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn backend(mut self, executor: Arc<dyn RunExecutor>) -> Self {
        self.backends.register(executor);
        self
    }

    /// Register the agent backend. The plane also uses the hub to answer
    /// agent reports and reap silent agents.
    pub fn agent_hub(mut self, hub: Arc<AgentHub>) -> Self {
        self.backends.register(hub.clone());
        self.hub = Some(hub);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn build(self) -> Plane {
        let config = self.config;
        let (reports, report_rx) = ReportReceiver::channel(config.report_buffer);
        let units = match self.units {
            Some(units) => units,
            None => Arc::new(RwLock::new(UnitStore::with_capacity(config.max_jobs))),
        };
        let pools = match self.pools {
            Some(pools) => pools,
            None => Arc::new(PoolRegistry::new()),
        };
        let store: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => Arc::new(MemoryCheckpointStore::new()),
        };

        let ctx = PlaneContext {
            units,
            pools,
            backends: self.backends,
            propagator: Arc::new(Propagator::new(config.illegal_transitions)),
            cancellations: Arc::new(CancelSet::new()),
            reports,
        };
        let tasks = Arc::new(
            Pipeline::new("tasks", &TASK_LISTS, store.clone())
                .with_transition(CancelTask)
                .with_transition(FinishTask)
                .with_transition(RelaunchTask)
                .with_transition(LaunchTask),
        );
        let steps = Arc::new(
            Pipeline::new("steps", &STEP_LISTS, store)
                .with_transition(RetireStep)
                .with_transition(TriggerStep),
        );
        let step_ctx = StepContext {
            plane: ctx.clone(),
            tasks: tasks.clone(),
        };

        Plane {
            config,
            ctx,
            step_ctx,
            steps,
            tasks,
            hub: self.hub,
            report_rx: Mutex::new(report_rx),
        }
    }
}

pub struct Plane {
    config: PlaneConfig,
    ctx: PlaneContext,
    step_ctx: StepContext,
    steps: Arc<Pipeline<StepWork, StepContext>>,
    tasks: Arc<Pipeline<TaskWork, PlaneContext>>,
    hub: Option<Arc<AgentHub>>,
    report_rx: Mutex<mpsc::Receiver<RunReport>>,
}

impl Plane {
    pub fn builder(config: PlaneConfig) -> PlaneBuilder {
        PlaneBuilder {
            config,
            units: None,
            pools: None,
            backends: BackendRegistry::new(),
            hub: None,
            checkpoints: None,
        }
    }

    /// Wire a plane from configuration: pools file, checkpoint directory,
    /// and the backends the configuration enables. The agent backend is
    /// always available.
    pub async fn from_config(config: PlaneConfig) -> Result<Self> {
        let pools = match &config.pools_file {
            Some(path) => PoolRegistry::load_file(path)?,
            None => PoolRegistry::new(),
        };
        let mut builder = Plane::builder(config.clone())
            .pools(Arc::new(pools))
            .agent_hub(Arc::new(AgentHub::new(config.agent_timeout())));
        if let Some(dir) = &config.checkpoint_dir {
            builder = builder.checkpoints(Arc::new(FileCheckpointStore::open(dir).await?));
        }
        if config.enable_docker {
            builder = builder.backend(Arc::new(DockerExecutor::new(config.docker.clone())));
        }
        if config.enable_kubernetes {
            builder = builder.backend(Arc::new(KubernetesExecutor::new(
                config.kubernetes.clone(),
            )));
        }
        Ok(builder.build())
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn context(&self) -> &PlaneContext {
        &self.ctx
    }

    pub fn units(&self) -> Arc<RwLock<UnitStore>> {
        self.ctx.units.clone()
    }

    pub fn pools(&self) -> Arc<PoolRegistry> {
        self.ctx.pools.clone()
    }

    pub fn agent_hub(&self) -> Option<Arc<AgentHub>> {
        self.hub.clone()
    }

    pub fn task_pipeline(&self) -> &Pipeline<TaskWork, PlaneContext> {
        &self.tasks
    }

    pub fn step_pipeline(&self) -> &Pipeline<StepWork, StepContext> {
        &self.steps
    }

    /// Rebuild both pipelines from the checkpoint store and resume reporting
    /// on launched runs. Call once, before the first tick.
    pub async fn recover(&self) -> Result<usize> {
        let steps = self.steps.recover().await?;
        let tasks = self.tasks.recover().await?;

        let launched: Vec<TaskWork> = self.tasks.lists().lock().await.get(LAUNCHED).to_vec();
        for work in launched {
            let run = self
                .ctx
                .units
                .read()
                .await
                .current_run(&work.task_id)
                .cloned();
            let Some(run) = run.filter(|r| !r.status.is_terminal()) else {
                continue;
            };
            let backend = self.ctx.backends.get(run.spec.backend)?;
            match backend.attach(&run, self.ctx.reports.clone()).await {
                Ok(Some(())) => {
                    tracing::info!(run_id = %run.id, task_id = %work.task_id, "Re-attached to run");
                }
                Ok(None) => {
                    tracing::warn!(run_id = %run.id, task_id = %work.task_id, "Run lost while the controller was down");
                    let report = RunReport::new(run.id, RunStatus::NoSuchContainer)
                        .with_reason("run lost while the controller was down");
                    self.apply_report(report).await?;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "Re-attach failed");
                }
            }
        }
        Ok(steps + tasks)
    }

    /// Validate and store a job without splitting it.
    pub async fn create_job(&self, spec: JobSpec) -> Result<JobId> {
        spec.validate()?;
        if self.ctx.pools.get(&spec.pool).is_none() {
            return Err(PlaneError::PoolNotFound(spec.pool.clone()));
        }
        for step in &spec.steps {
            self.ctx.pools.validate(&spec.pool, &step.resources)?;
        }
        let job = Job::new(spec);
        let name = job.name.clone();
        let job_id = self.ctx.units.write().await.insert_job(job)?;
        tracing::info!(job_id = %job_id, name = %name, "Job created");
        Ok(job_id)
    }

    /// Split a created job and hand its steps to the step pipeline.
    pub async fn split_job(&self, job_id: JobId) -> Result<Vec<StepId>> {
        let step_ids = {
            let _guard = self.ctx.propagator.lock(job_id).await;
            self.ctx
                .units
                .write()
                .await
                .split_job(&job_id, &self.ctx.pools)?
        };
        for step_id in &step_ids {
            self.steps
                .admit(
                    WAITING,
                    StepWork {
                        step_id: *step_id,
                        job_id,
                    },
                )
                .await?;
        }
        Ok(step_ids)
    }

    pub async fn submit_job(&self, spec: JobSpec) -> Result<JobId> {
        let job_id = self.create_job(spec).await?;
        self.split_job(job_id).await?;
        Ok(job_id)
    }

    /// Cancel a job: it turns CANCELED at once, steps that never started are
    /// canceled with their tasks, and every other unfinished task is marked
    /// for the task pipeline to stop. Returns false if the job was already
    /// final.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let guard = self.ctx.propagator.lock(job_id).await;
        let mut units = self.ctx.units.write().await;
        if units.require_job(&job_id)?.is_final() {
            return Ok(false);
        }
        self.ctx
            .propagator
            .set_job_status(&guard, &mut units, JobStatus::Canceled)?;

        let unstarted: Vec<StepId> = units
            .steps_of(&job_id)
            .iter()
            .filter(|s| s.status == StepStatus::Created)
            .map(|s| s.id)
            .collect();
        for step_id in unstarted {
            self.ctx.propagator.cancel_step(&guard, &mut units, step_id)?;
        }

        let unfinished: Vec<TaskId> = units
            .tasks_of_job(&job_id)
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for task_id in &unfinished {
            self.ctx.cancellations.mark(*task_id);
        }
        tracing::info!(job_id = %job_id, pending = unfinished.len(), "Job canceled");
        Ok(true)
    }

    /// Cancel one task. A task already handed to the task pipeline is
    /// marked and canceled by the next tick; one that was never admitted is
    /// canceled immediately. Returns false if the task was already final.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        if self
            .ctx
            .units
            .read()
            .await
            .require_task(&task_id)?
            .status
            .is_terminal()
        {
            return Ok(false);
        }
        let admitted = self.tasks.lists().lock().await.contains(&task_id);
        if admitted {
            self.ctx.cancellations.mark(task_id);
            tracing::info!(task_id = %task_id, "Task marked for cancellation");
        } else {
            self.ctx
                .propagator
                .update_task(&self.ctx.units, task_id, TaskStatus::Canceled, None)
                .await?;
        }
        Ok(true)
    }

    /// Run `command` inside the task's current run.
    pub async fn exec(&self, task_id: TaskId, command: &[String]) -> Result<ExecOutput> {
        if command.is_empty() {
            return Err(PlaneError::Validation("exec needs a command".to_string()));
        }
        let run = {
            let units = self.ctx.units.read().await;
            units.require_task(&task_id)?;
            units.current_run(&task_id).cloned()
        };
        let run = run.ok_or_else(|| {
            PlaneError::Validation(format!("task {} has no run to exec into", task_id))
        })?;
        if run.status.is_terminal() {
            return Err(PlaneError::Validation(format!(
                "run {} already finished ({})",
                run.id, run.status
            )));
        }
        self.ctx
            .backends
            .get(run.spec.backend)?
            .exec(&run, command)
            .await?
            .ok_or(PlaneError::RunNotFound(run.id))
    }

    /// Apply one backend report.
    pub async fn apply_report(&self, report: RunReport) -> Result<Propagation> {
        let propagation = reports::apply_report(&self.ctx, report).await?;
        for step_id in &propagation.triggered {
            let job_id = self
                .ctx
                .units
                .read()
                .await
                .step(step_id)
                .map(|s| s.job_id);
            if let Some(job_id) = job_id {
                let work = StepWork {
                    step_id: *step_id,
                    job_id,
                };
                if self.steps.admit(WAITING, work).await? {
                    tracing::debug!(step_id = %step_id, "Triggered step admitted");
                }
            }
        }
        if let Some(status) = propagation.job_finished() {
            tracing::info!(status = %status, "Job finished");
        }
        Ok(propagation)
    }

    /// Apply everything the backends have reported so far, in order.
    pub async fn drain_reports(&self) -> Result<usize> {
        let mut rx = self.report_rx.lock().await;
        let mut applied = 0;
        while let Ok(report) = rx.try_recv() {
            self.apply_report(report).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Answer an agent's periodic report.
    pub async fn handle_agent_report(&self, report: AgentReport) -> Result<AgentDirective> {
        let hub = self
            .hub
            .as_ref()
            .ok_or_else(|| PlaneError::Backend("agent backend is not enabled".to_string()))?;
        let directive = hub.handle_report(report).await;
        self.drain_reports().await?;
        Ok(directive)
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.ctx
            .units
            .read()
            .await
            .all_jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn job_detail(&self, job_id: JobId) -> Result<JobDetail> {
        self.ctx
            .units
            .read()
            .await
            .detail(&job_id)
            .ok_or(PlaneError::JobNotFound(job_id))
    }

    /// Archive terminal jobs past their retention.
    pub async fn cleanup(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.config.job_retention()) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        let removed = self.ctx.units.write().await.cleanup_finished_jobs(cutoff);
        if removed > 0 {
            tracing::info!(removed, "Archived finished jobs");
        }
        removed
    }

    /// One controller cycle: reports, timeouts, agent liveness, the step
    /// pipeline, the task pipeline, reports again, retention.
    pub async fn tick(&self) -> Result<TickSummary> {
        let mut summary = TickSummary {
            reports: self.drain_reports().await?,
            ..Default::default()
        };
        if let Some(timeout) = self.config.run_timeout() {
            summary.timed_out = reports::expire_runs(&self.ctx, timeout).await?;
        }
        if let Some(hub) = &self.hub {
            for agent_id in hub.reap_dead_agents().await {
                tracing::warn!(agent_id = %agent_id, "Agent reaped");
            }
        }
        summary.steps = self.steps.tick(&self.step_ctx).await?;
        summary.tasks = self.tasks.tick(&self.ctx).await?;
        summary.reports += self.drain_reports().await?;
        summary.archived = self.cleanup().await;
        self.ctx.propagator.prune_locks();
        Ok(summary)
    }

    /// Tick until `shutdown` fires. Expects [`Plane::recover`] to have run.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Controller loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if !summary.is_idle() => {
                            tracing::debug!(?summary, "Tick");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_infrastructure() => {
                            tracing::error!(error = %e, "Tick aborted by infrastructure failure");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Tick failed");
                        }
                    }
                }
            }
        }
    }
}
