use crate::model::{JobId, StepId, TaskId, UnitStore};
use crate::status::{calculate, ChildState, Derived, JobStatus, StepStatus, TaskStatus};

/// A status change that has been applied to the unit store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Task {
        task_id: TaskId,
        step_id: StepId,
        job_id: JobId,
        from: TaskStatus,
        to: TaskStatus,
    },
    Step {
        step_id: StepId,
        job_id: JobId,
        from: StepStatus,
        to: StepStatus,
    },
    Job {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// What a watcher wants done in response to a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StepStatus { step_id: StepId, status: StepStatus },
    JobStatus { job_id: JobId, status: JobStatus },
    /// Schedule a step whose predecessor succeeded.
    Trigger(StepId),
    /// Cancel a step that never started.
    CancelStep(StepId),
}

/// Observer invoked, in chain order, on every applied status change.
///
/// Watchers only read; the propagator applies their effects.
pub trait Watcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn observe(&self, change: &StatusChange, units: &UnitStore) -> Vec<Effect>;
}

/// Calculator result, with one settlement: children that are all terminal
/// but neither all successful nor failed (some canceled) settle the parent
/// as canceled instead of leaving it where it is forever.
fn settle<S>(children: Vec<S>) -> Derived
where
    S: Into<ChildState> + Copy,
{
    let derived = calculate(children.iter().copied());
    let all_terminal = children
        .iter()
        .all(|c| Into::<ChildState>::into(*c).is_terminal());
    if derived == Derived::Created && !children.is_empty() && all_terminal {
        Derived::Canceled
    } else {
        derived
    }
}

/// Recomputes a step from its tasks.
#[derive(Debug, Default)]
pub struct StepWatcher;

impl Watcher for StepWatcher {
    fn name(&self) -> &'static str {
        "step"
    }

    fn observe(&self, change: &StatusChange, units: &UnitStore) -> Vec<Effect> {
        let StatusChange::Task { step_id, .. } = *change else {
            return Vec::new();
        };
        let Some(step) = units.step(&step_id) else {
            return Vec::new();
        };
        let derived = settle(units.task_statuses(&step_id));
        if derived == Derived::Created {
            return Vec::new();
        }
        let desired = StepStatus::from(derived);
        if desired == step.status {
            return Vec::new();
        }
        vec![Effect::StepStatus {
            step_id,
            status: desired,
        }]
    }
}

/// Recomputes a job from its steps, unless the job is already final.
#[derive(Debug, Default)]
pub struct JobWatcher;

impl Watcher for JobWatcher {
    fn name(&self) -> &'static str {
        "job"
    }

    fn observe(&self, change: &StatusChange, units: &UnitStore) -> Vec<Effect> {
        let StatusChange::Step { job_id, .. } = *change else {
            return Vec::new();
        };
        let Some(job) = units.job(&job_id) else {
            return Vec::new();
        };
        if job.is_final() {
            return Vec::new();
        }
        match JobStatus::from_derived(settle(units.step_statuses(&job_id))) {
            Some(desired) if desired != job.status => vec![Effect::JobStatus {
                job_id,
                status: desired,
            }],
            _ => Vec::new(),
        }
    }
}

/// Follows `next` links: a successful step triggers its successor, a failed
/// or canceled one cancels every later step that hasn't started.
#[derive(Debug, Default)]
pub struct PipelineWatcher;

impl Watcher for PipelineWatcher {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn observe(&self, change: &StatusChange, units: &UnitStore) -> Vec<Effect> {
        let StatusChange::Step {
            step_id, job_id, to, ..
        } = *change
        else {
            return Vec::new();
        };
        let Some(step) = units.step(&step_id) else {
            return Vec::new();
        };
        match to {
            StepStatus::Success => {
                let job_final = units.job(&job_id).map_or(true, |j| j.is_final());
                match step.next {
                    Some(next) if !job_final => vec![Effect::Trigger(next)],
                    _ => Vec::new(),
                }
            }
            StepStatus::Fail | StepStatus::Canceled => {
                let mut effects = Vec::new();
                let mut cursor = step.next;
                while let Some(id) = cursor {
                    let Some(downstream) = units.step(&id) else {
                        break;
                    };
                    if downstream.status == StepStatus::Created {
                        effects.push(Effect::CancelStep(id));
                    }
                    cursor = downstream.next;
                }
                effects
            }
            _ => Vec::new(),
        }
    }
}

/// The standard chain: step recomputation, job recomputation, linking.
pub fn default_chain() -> Vec<Box<dyn Watcher>> {
    vec![
        Box::new(StepWatcher),
        Box::new(JobWatcher),
        Box::new(PipelineWatcher),
    ]
}
