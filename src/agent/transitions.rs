use async_trait::async_trait;

use super::{AgentContext, AgentTask, FINISHED, RECEIVED, RUNNING};
use crate::error::{PlaneError, Result};
use crate::pipeline::{ListName, Transition};
use crate::scheduler::RunReport;
use crate::status::{Lifecycle, RunStatus};

/// Stop a run the controller canceled, started or not.
pub struct StopRun;

#[async_trait]
impl Transition<AgentTask, AgentContext> for StopRun {
    fn name(&self) -> &'static str {
        "stop_run"
    }

    fn sources(&self) -> &[ListName] {
        &[RECEIVED, RUNNING]
    }

    fn target(&self) -> Option<ListName> {
        Some(FINISHED)
    }

    async fn valid(&self, task: &AgentTask, ctx: &AgentContext) -> bool {
        ctx.cancels.contains(&task.assignment.task_id)
    }

    async fn processing(&self, mut task: AgentTask, ctx: &AgentContext) -> Result<AgentTask> {
        let run = task.assignment.to_run();
        if ctx.executor.stop(&run).await?.is_none() {
            tracing::debug!(run_id = %run.id, "Nothing to stop");
        }
        if let Err(e) = ctx.executor.remove(&run).await {
            tracing::warn!(run_id = %run.id, error = %e, "Failed to remove stopped run");
        }
        ctx.observations.forget(&run.id);
        task.settle(&RunReport::new(run.id, RunStatus::Canceled).with_reason("canceled by controller"));
        tracing::info!(run_id = %run.id, task_id = %run.task_id, "Run stopped");
        Ok(task)
    }

    async fn success(&self, _before: &AgentTask, after: &AgentTask, ctx: &AgentContext) {
        ctx.cancels.clear(&after.assignment.task_id);
    }
}

/// Start a received run, adopting it instead if the engine already has it.
pub struct StartRun;

#[async_trait]
impl Transition<AgentTask, AgentContext> for StartRun {
    fn name(&self) -> &'static str {
        "start_run"
    }

    fn sources(&self) -> &[ListName] {
        &[RECEIVED]
    }

    fn target(&self) -> Option<ListName> {
        Some(RUNNING)
    }

    async fn valid(&self, task: &AgentTask, ctx: &AgentContext) -> bool {
        !ctx.cancels.contains(&task.assignment.task_id)
    }

    async fn processing(&self, mut task: AgentTask, ctx: &AgentContext) -> Result<AgentTask> {
        let run = task.assignment.to_run();
        match ctx.executor.probe(&run).await? {
            Some(status) if status.is_terminal() => {
                tracing::info!(run_id = %run.id, status = %status, "Run already finished");
                ctx.observations.record(RunReport::new(run.id, status));
            }
            Some(status) => {
                tracing::info!(run_id = %run.id, status = %status, "Adopting existing run");
                if ctx.executor.attach(&run, ctx.reports.clone()).await?.is_none() {
                    ctx.executor.run(&run, ctx.reports.clone()).await?;
                }
            }
            None => {
                ctx.executor.run(&run, ctx.reports.clone()).await?;
                tracing::info!(run_id = %run.id, task_id = %run.task_id, "Run started");
            }
        }
        if task.status == RunStatus::Created {
            task.status = RunStatus::Preparing;
        }
        Ok(task)
    }

    async fn fail(&self, task: &AgentTask, ctx: &AgentContext, error: &PlaneError) {
        tracing::warn!(run_id = %task.assignment.run_id, error = %error, "Failed to start run");
        // the controller learns about it through the next report
        ctx.observations.record(
            RunReport::new(task.assignment.run_id, RunStatus::Fail).with_reason(error.to_string()),
        );
    }
}

/// Record the terminal status the engine reported.
pub struct SettleRun;

#[async_trait]
impl Transition<AgentTask, AgentContext> for SettleRun {
    fn name(&self) -> &'static str {
        "settle_run"
    }

    fn sources(&self) -> &[ListName] {
        &[RECEIVED, RUNNING]
    }

    fn target(&self) -> Option<ListName> {
        Some(FINISHED)
    }

    async fn valid(&self, task: &AgentTask, ctx: &AgentContext) -> bool {
        ctx.observations
            .get(&task.assignment.run_id)
            .is_some_and(|r| r.status.is_terminal())
    }

    async fn processing(&self, mut task: AgentTask, ctx: &AgentContext) -> Result<AgentTask> {
        if let Some(report) = ctx.observations.get(&task.assignment.run_id) {
            task.settle(&report);
        }
        if let Err(e) = ctx.executor.remove(&task.assignment.to_run()).await {
            tracing::warn!(run_id = %task.assignment.run_id, error = %e, "Failed to remove finished run");
        }
        tracing::info!(run_id = %task.assignment.run_id, status = %task.status, "Run finished");
        Ok(task)
    }
}

/// Drop a finished run once the controller has acknowledged it.
pub struct ForgetRun;

#[async_trait]
impl Transition<AgentTask, AgentContext> for ForgetRun {
    fn name(&self) -> &'static str {
        "forget_run"
    }

    fn sources(&self) -> &[ListName] {
        &[FINISHED]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, task: &AgentTask, ctx: &AgentContext) -> bool {
        ctx.is_acknowledged(&task.assignment.run_id)
    }

    async fn processing(&self, task: AgentTask, ctx: &AgentContext) -> Result<AgentTask> {
        ctx.observations.forget(&task.assignment.run_id);
        Ok(task)
    }

    async fn success(&self, _before: &AgentTask, after: &AgentTask, ctx: &AgentContext) {
        ctx.clear_acknowledged(&after.assignment.run_id);
    }
}
