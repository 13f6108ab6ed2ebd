//! Bottom-up status propagation.
//!
//! Every task status change runs through an ordered [`Watcher`] chain that
//! recomputes the owning step and job. All recomputation for one job is
//! serialized by a per-job lock: callers take a [`JobGuard`] first, then the
//! unit store's write lock, always in that order.

pub mod locks;
pub mod watcher;

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::config::IllegalTransitionPolicy;
use crate::error::{PlaneError, Result};
use crate::model::{JobId, StepId, TaskId, UnitStore};
use crate::status::{JobStatus, Lifecycle, StepStatus, TaskStatus};

pub use locks::KeyedLocks;
pub use watcher::{
    default_chain, Effect, JobWatcher, PipelineWatcher, StatusChange, StepWatcher, Watcher,
};

/// Proof that the caller holds the propagation lock of one job.
#[derive(Debug)]
pub struct JobGuard {
    job_id: JobId,
    _guard: OwnedMutexGuard<()>,
}

impl JobGuard {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// A transition the state machine refused and the policy swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppressed {
    pub level: &'static str,
    pub from: String,
    pub to: String,
}

/// Everything one propagation did.
#[derive(Debug, Clone, Default)]
pub struct Propagation {
    pub changes: Vec<StatusChange>,
    /// Steps whose predecessor succeeded and which should now be scheduled.
    pub triggered: Vec<StepId>,
    pub suppressed: Vec<Suppressed>,
}

impl Propagation {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.triggered.is_empty() && self.suppressed.is_empty()
    }

    /// The job's final status, if this propagation made it final.
    pub fn job_finished(&self) -> Option<JobStatus> {
        self.changes.iter().find_map(|c| match c {
            StatusChange::Job { to, .. } if to.is_terminal() => Some(*to),
            _ => None,
        })
    }

    pub fn merge(&mut self, other: Propagation) {
        self.changes.extend(other.changes);
        self.triggered.extend(other.triggered);
        self.suppressed.extend(other.suppressed);
    }
}

pub struct Propagator {
    locks: KeyedLocks<JobId>,
    watchers: Vec<Box<dyn Watcher>>,
    policy: IllegalTransitionPolicy,
}

impl Propagator {
    pub fn new(policy: IllegalTransitionPolicy) -> Self {
        Self::with_watchers(policy, default_chain())
    }

    pub fn with_watchers(policy: IllegalTransitionPolicy, watchers: Vec<Box<dyn Watcher>>) -> Self {
        Self {
            locks: KeyedLocks::new(),
            watchers,
            policy,
        }
    }

    pub fn policy(&self) -> IllegalTransitionPolicy {
        self.policy
    }

    pub async fn lock(&self, job_id: JobId) -> JobGuard {
        JobGuard {
            job_id,
            _guard: self.locks.lock(job_id).await,
        }
    }

    /// Forget locks of jobs nobody is working on.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Lock the task's job, then apply the change and propagate it.
    pub async fn update_task(
        &self,
        units: &RwLock<UnitStore>,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<Propagation> {
        let job_id = units.read().await.require_task(&task_id)?.job_id;
        let guard = self.lock(job_id).await;
        let mut units = units.write().await;
        self.set_task_status(&guard, &mut units, task_id, status, reason)
    }

    /// Apply a task status and run the watcher chain to a fixed point.
    ///
    /// Setting the current status again is a no-op.
    pub fn set_task_status(
        &self,
        guard: &JobGuard,
        units: &mut UnitStore,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<Propagation> {
        self.all_or_nothing(guard, units, |units| {
            let mut propagation = Propagation::default();
            let mut queue = VecDeque::new();
            if let Some(change) =
                self.apply_task(guard, units, task_id, status, reason, &mut propagation)?
            {
                queue.push_back(change);
            }
            self.drain(units, queue, &mut propagation)?;
            Ok(propagation)
        })
    }

    /// Set a job status outside of recomputation (split, scheduling,
    /// cancellation).
    pub fn set_job_status(
        &self,
        guard: &JobGuard,
        units: &mut UnitStore,
        status: JobStatus,
    ) -> Result<Propagation> {
        self.all_or_nothing(guard, units, |units| {
            let mut propagation = Propagation::default();
            let mut queue = VecDeque::new();
            if let Some(change) = self.apply_job(units, guard.job_id, status, &mut propagation)? {
                queue.push_back(change);
            }
            self.drain(units, queue, &mut propagation)?;
            Ok(propagation)
        })
    }

    /// Cancel a step that never started, together with its tasks.
    pub fn cancel_step(
        &self,
        guard: &JobGuard,
        units: &mut UnitStore,
        step_id: StepId,
    ) -> Result<Propagation> {
        self.check_owner(guard, units.require_step(&step_id)?.job_id)?;
        self.all_or_nothing(guard, units, |units| {
            let mut propagation = Propagation::default();
            let mut queue = VecDeque::new();
            self.cancel_created_step(units, step_id, &mut queue, &mut propagation)?;
            self.drain(units, queue, &mut propagation)?;
            Ok(propagation)
        })
    }

    /// Run one propagation against the guarded job. On error the job and
    /// everything it owns are put back as they were, so a refused chain
    /// leaves no partial writes behind.
    fn all_or_nothing<F>(
        &self,
        guard: &JobGuard,
        units: &mut UnitStore,
        apply: F,
    ) -> Result<Propagation>
    where
        F: FnOnce(&mut UnitStore) -> Result<Propagation>,
    {
        let before = units.detail(&guard.job_id);
        let result = apply(units);
        if let (Err(e), Some(before)) = (&result, before) {
            tracing::debug!(job_id = %guard.job_id, error = %e, "Propagation rolled back");
            units.restore(before);
        }
        result
    }

    fn check_owner(&self, guard: &JobGuard, job_id: JobId) -> Result<()> {
        if guard.job_id != job_id {
            return Err(PlaneError::Internal(format!(
                "holding lock of job {} while updating job {}",
                guard.job_id, job_id
            )));
        }
        Ok(())
    }

    fn drain(
        &self,
        units: &mut UnitStore,
        mut queue: VecDeque<StatusChange>,
        propagation: &mut Propagation,
    ) -> Result<()> {
        while let Some(change) = queue.pop_front() {
            propagation.changes.push(change);
            for watcher in &self.watchers {
                for effect in watcher.observe(&change, units) {
                    tracing::debug!(watcher = watcher.name(), effect = ?effect, "Watcher effect");
                    match effect {
                        Effect::StepStatus { step_id, status } => {
                            if let Some(next) = self.apply_step(units, step_id, status, propagation)? {
                                queue.push_back(next);
                            }
                        }
                        Effect::JobStatus { job_id, status } => {
                            if let Some(next) = self.apply_job(units, job_id, status, propagation)? {
                                queue.push_back(next);
                            }
                        }
                        Effect::Trigger(step_id) => {
                            if !propagation.triggered.contains(&step_id) {
                                propagation.triggered.push(step_id);
                            }
                        }
                        Effect::CancelStep(step_id) => {
                            self.cancel_created_step(units, step_id, &mut queue, propagation)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn cancel_created_step(
        &self,
        units: &mut UnitStore,
        step_id: StepId,
        queue: &mut VecDeque<StatusChange>,
        propagation: &mut Propagation,
    ) -> Result<()> {
        if let Some(change) = self.apply_step(units, step_id, StepStatus::Canceled, propagation)? {
            queue.push_back(change);
        }
        let created: Vec<TaskId> = units
            .tasks_of(&step_id)
            .iter()
            .filter(|t| t.status == TaskStatus::Created)
            .map(|t| t.id)
            .collect();
        for task_id in created {
            if let Some(task) = units.task_mut(&task_id) {
                task.status = TaskStatus::Canceled;
                queue.push_back(StatusChange::Task {
                    task_id,
                    step_id,
                    job_id: task.job_id,
                    from: TaskStatus::Created,
                    to: TaskStatus::Canceled,
                });
            }
        }
        Ok(())
    }

    /// Decide what to do with a transition the table doesn't allow.
    fn refuse<S: Lifecycle>(
        &self,
        from: S,
        to: S,
        propagation: &mut Propagation,
    ) -> Result<Option<StatusChange>> {
        match self.policy {
            IllegalTransitionPolicy::Suppress => {
                tracing::warn!(level = S::LEVEL, from = %from, to = %to, "Illegal transition suppressed");
                propagation.suppressed.push(Suppressed {
                    level: S::LEVEL,
                    from: from.to_string(),
                    to: to.to_string(),
                });
                Ok(None)
            }
            IllegalTransitionPolicy::Reject => Err(PlaneError::IllegalTransition {
                level: S::LEVEL,
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    fn apply_task(
        &self,
        guard: &JobGuard,
        units: &mut UnitStore,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
        propagation: &mut Propagation,
    ) -> Result<Option<StatusChange>> {
        let task = units.require_task(&task_id)?;
        self.check_owner(guard, task.job_id)?;
        let from = task.status;
        if from == status {
            return Ok(None);
        }
        if !from.can_transition_to(status) {
            return self.refuse(from, status, propagation);
        }

        let (job_id, step_id, index) = (task.job_id, task.step_id, task.index);
        if let Some(task) = units.task_mut(&task_id) {
            task.status = status;
            if status == TaskStatus::Fail {
                task.failure_reason = reason.clone();
            }
        }
        if status == TaskStatus::Fail {
            let step_name = units
                .step(&step_id)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            if let Some(job) = units.job_mut(&job_id) {
                if job.failure_reason.is_none() {
                    job.failure_reason = Some(format!(
                        "task {} of step {} failed: {}",
                        index,
                        step_name,
                        reason.as_deref().unwrap_or("no reason reported")
                    ));
                }
            }
        }
        tracing::info!(task_id = %task_id, job_id = %job_id, from = %from, to = %status, "Task status changed");
        Ok(Some(StatusChange::Task {
            task_id,
            step_id,
            job_id,
            from,
            to: status,
        }))
    }

    fn apply_step(
        &self,
        units: &mut UnitStore,
        step_id: StepId,
        status: StepStatus,
        propagation: &mut Propagation,
    ) -> Result<Option<StatusChange>> {
        let step = units.step_mut(&step_id).ok_or(PlaneError::StepNotFound(step_id))?;
        let from = step.status;
        if from == status {
            return Ok(None);
        }
        if !from.can_transition_to(status) {
            return self.refuse(from, status, propagation);
        }
        step.status = status;
        if status.is_terminal() {
            step.finished_at = Some(Utc::now());
        }
        let job_id = step.job_id;
        tracing::info!(step_id = %step_id, job_id = %job_id, from = %from, to = %status, "Step status changed");
        Ok(Some(StatusChange::Step {
            step_id,
            job_id,
            from,
            to: status,
        }))
    }

    fn apply_job(
        &self,
        units: &mut UnitStore,
        job_id: JobId,
        status: JobStatus,
        propagation: &mut Propagation,
    ) -> Result<Option<StatusChange>> {
        let job = units.job_mut(&job_id).ok_or(PlaneError::JobNotFound(job_id))?;
        let from = job.status;
        if from == status {
            return Ok(None);
        }
        if !from.can_transition_to(status) {
            return self.refuse(from, status, propagation);
        }
        job.status = status;
        if status.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        if status == JobStatus::Fail && job.failure_reason.is_none() {
            job.failure_reason = Some("a step failed".to_string());
        }
        tracing::info!(job_id = %job_id, from = %from, to = %status, "Job status changed");
        Ok(Some(StatusChange::Job {
            job_id,
            from,
            to: status,
        }))
    }
}
