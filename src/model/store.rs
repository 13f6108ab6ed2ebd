use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{partition, Job, JobId, Partition, Run, RunId, Step, StepId, Task, TaskId};
use crate::error::{PlaneError, Result};
use crate::pool::PoolRegistry;
use crate::status::{JobStatus, Lifecycle, RunStatus, StepStatus, TaskStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// A job with everything it owns, for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub steps: Vec<Step>,
    pub tasks: Vec<Task>,
    pub runs: Vec<Run>,
}

/// In-memory unit graph.
///
/// Status fields are only ever written through the propagator; this type
/// owns structure (split, links, run bookkeeping) and lookups.
#[derive(Debug)]
pub struct UnitStore {
    jobs: HashMap<JobId, Job>,
    steps: HashMap<StepId, Step>,
    tasks: HashMap<TaskId, Task>,
    runs: HashMap<RunId, Run>,
    max_jobs: usize,
}

impl Default for UnitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            steps: HashMap::new(),
            tasks: HashMap::new(),
            runs: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a new job. Fails if the store is at capacity.
    pub fn insert_job(&mut self, job: Job) -> Result<JobId> {
        if self.is_full() {
            return Err(PlaneError::Validation(format!(
                "job store is full ({} jobs)",
                self.max_jobs
            )));
        }
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.get_mut(id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn run(&self, id: &RunId) -> Option<&Run> {
        self.runs.get(id)
    }

    pub fn run_mut(&mut self, id: &RunId) -> Option<&mut Run> {
        self.runs.get_mut(id)
    }

    pub fn require_job(&self, id: &JobId) -> Result<&Job> {
        self.job(id).ok_or(PlaneError::JobNotFound(*id))
    }

    pub fn require_step(&self, id: &StepId) -> Result<&Step> {
        self.step(id).ok_or(PlaneError::StepNotFound(*id))
    }

    pub fn require_task(&self, id: &TaskId) -> Result<&Task> {
        self.task(id).ok_or(PlaneError::TaskNotFound(*id))
    }

    pub fn require_run(&self, id: &RunId) -> Result<&Run> {
        self.run(id).ok_or(PlaneError::RunNotFound(*id))
    }

    /// Expand a job into linked steps and their tasks. Allowed once.
    ///
    /// Every step's resource request is validated against the job's pool
    /// before anything is inserted, so a rejected split leaves the job
    /// untouched.
    pub fn split_job(&mut self, job_id: &JobId, pools: &PoolRegistry) -> Result<Vec<StepId>> {
        let job = self.require_job(job_id)?;
        if job.is_split() || job.status != JobStatus::Created {
            return Err(PlaneError::AlreadySplit(*job_id));
        }
        job.spec.validate()?;

        let mut shaped = Vec::with_capacity(job.spec.steps.len());
        for template in &job.spec.steps {
            let (_, request) = pools.validate(&job.pool, &template.resources)?;
            shaped.push(request);
        }

        let job_id = job.id;
        let templates = job.spec.steps.clone();
        let dataset = job.spec.dataset.clone();

        let mut step_ids = Vec::with_capacity(templates.len());
        for ((index, template), request) in templates.into_iter().enumerate().zip(shaped) {
            let mut step = Step::new(job_id, index as u32, template);
            let slices = match (step.template.partition, &dataset) {
                (Partition::Slice, Some(ds)) => {
                    Some(partition(ds.items, step.template.parallelism)?)
                }
                _ => None,
            };
            for i in 0..step.template.parallelism {
                let slice = slices.as_ref().and_then(|s| s.get(i as usize).copied());
                let task = Task::new(
                    job_id,
                    step.id,
                    i,
                    request.clone(),
                    slice,
                    step.template.max_retries,
                );
                step.tasks.push(task.id);
                self.tasks.insert(task.id, task);
            }
            step_ids.push(step.id);
            self.steps.insert(step.id, step);
        }

        for pair in step_ids.windows(2) {
            if let Some(step) = self.steps.get_mut(&pair[0]) {
                step.next = Some(pair[1]);
            }
        }

        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.steps = step_ids.clone();
            job.status = JobStatus::Split;
        }
        tracing::info!(job_id = %job_id, steps = step_ids.len(), "Job split");
        Ok(step_ids)
    }

    /// The step whose `next` points at `step_id`.
    pub fn predecessor(&self, step_id: &StepId) -> Option<&Step> {
        let step = self.steps.get(step_id)?;
        let job = self.jobs.get(&step.job_id)?;
        job.steps
            .iter()
            .filter_map(|id| self.steps.get(id))
            .find(|s| s.next == Some(*step_id))
    }

    pub fn steps_of(&self, job_id: &JobId) -> Vec<&Step> {
        self.jobs
            .get(job_id)
            .map(|job| job.steps.iter().filter_map(|id| self.steps.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn tasks_of(&self, step_id: &StepId) -> Vec<&Task> {
        self.steps
            .get(step_id)
            .map(|step| step.tasks.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn tasks_of_job(&self, job_id: &JobId) -> Vec<&Task> {
        self.steps_of(job_id)
            .into_iter()
            .flat_map(|step| step.tasks.iter().filter_map(|id| self.tasks.get(id)))
            .collect()
    }

    pub fn task_statuses(&self, step_id: &StepId) -> Vec<TaskStatus> {
        self.tasks_of(step_id).iter().map(|t| t.status).collect()
    }

    pub fn step_statuses(&self, job_id: &JobId) -> Vec<StepStatus> {
        self.steps_of(job_id).iter().map(|s| s.status).collect()
    }

    /// Record a freshly created run against its task.
    pub fn insert_run(&mut self, run: Run) -> Result<RunId> {
        let task = self
            .tasks
            .get_mut(&run.task_id)
            .ok_or(PlaneError::TaskNotFound(run.task_id))?;
        let id = run.id;
        if !task.runs.contains(&id) {
            task.runs.push(id);
        }
        self.runs.insert(id, run);
        Ok(id)
    }

    /// The run of the task's current attempt, if created.
    pub fn current_run(&self, task_id: &TaskId) -> Option<&Run> {
        let task = self.tasks.get(task_id)?;
        let run = self.runs.get(&task.current_run()?)?;
        (run.attempt == task.attempt).then_some(run)
    }

    /// Tasks of a step currently preparing or running.
    pub fn active_in_step(&self, step_id: &StepId) -> usize {
        self.tasks_of(step_id)
            .iter()
            .filter(|t| t.status.is_active())
            .count()
    }

    /// Tasks of jobs in `pool` currently preparing or running.
    pub fn active_in_pool(&self, pool: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_active())
            .filter(|t| self.jobs.get(&t.job_id).is_some_and(|j| j.pool == pool))
            .count()
    }

    /// Non-terminal runs, for timeout checks.
    pub fn unfinished_runs(&self) -> Vec<&Run> {
        self.runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .collect()
    }

    /// Force a run into a terminal status the backend never reported
    /// (cancellation, timeout, dispatch failure). Returns false when the run
    /// is unknown or already terminal.
    pub fn close_run(&mut self, run_id: &RunId, status: RunStatus, reason: Option<String>) -> bool {
        let Some(run) = self.runs.get_mut(run_id) else {
            return false;
        };
        if !run.status.can_transition_to(status) {
            return false;
        }
        run.status = status;
        run.finished_at = Some(Utc::now());
        if reason.is_some() {
            run.failure_reason = reason;
        }
        true
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn detail(&self, job_id: &JobId) -> Option<JobDetail> {
        let job = self.jobs.get(job_id)?.clone();
        let steps: Vec<Step> = self.steps_of(job_id).into_iter().cloned().collect();
        let tasks: Vec<Task> = self.tasks_of_job(job_id).into_iter().cloned().collect();
        let runs = tasks
            .iter()
            .flat_map(|t| t.runs.iter().filter_map(|id| self.runs.get(id)).cloned())
            .collect();
        Some(JobDetail {
            job,
            steps,
            tasks,
            runs,
        })
    }

    /// Put back a job and everything it owns as captured by [`detail`].
    ///
    /// [`detail`]: UnitStore::detail
    pub fn restore(&mut self, detail: JobDetail) {
        for run in detail.runs {
            self.runs.insert(run.id, run);
        }
        for task in detail.tasks {
            self.tasks.insert(task.id, task);
        }
        for step in detail.steps {
            self.steps.insert(step.id, step);
        }
        self.jobs.insert(detail.job.id, detail.job);
    }

    /// Archive terminal jobs that finished at or before `cutoff`, together
    /// with their steps, tasks and runs. Returns the number of jobs removed.
    pub fn cleanup_finished_jobs(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.is_final() && j.finished_at.is_some_and(|at| at <= cutoff))
            .map(|j| j.id)
            .collect();
        for job_id in &expired {
            let Some(job) = self.jobs.remove(job_id) else {
                continue;
            };
            for step_id in job.steps {
                let Some(step) = self.steps.remove(&step_id) else {
                    continue;
                };
                for task_id in step.tasks {
                    if let Some(task) = self.tasks.remove(&task_id) {
                        for run_id in task.runs {
                            self.runs.remove(&run_id);
                        }
                    }
                }
            }
        }
        expired.len()
    }

    /// Returns the current number of jobs in the store
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
