//! Status vocabularies and transition tables for every unit level.
//!
//! Each level (Job, Step, Task, Run) has its own enum implementing
//! [`Lifecycle`]. The tables are closed: anything not listed in
//! `can_transition_to` is illegal, and no terminal status has an outgoing
//! edge. Parent statuses are derived from children by [`calculator`].

pub mod calculator;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use calculator::{calculate, ChildState, Derived};

/// Shared behaviour of the per-level state machines.
pub trait Lifecycle: Copy + Eq + fmt::Debug + fmt::Display {
    /// Level name used in logs and `IllegalTransition` errors.
    const LEVEL: &'static str;

    fn is_terminal(self) -> bool;

    fn can_transition_to(self, next: Self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Created,
    Preparing,
    Running,
    Success,
    Fail,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Created,
        TaskStatus::Preparing,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Fail,
        TaskStatus::Canceled,
    ];

    /// Counts against step and pool concurrency bounds.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Preparing | TaskStatus::Running)
    }
}

impl Lifecycle for TaskStatus {
    const LEVEL: &'static str = "task";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Fail | TaskStatus::Canceled
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Preparing) | (Preparing, Running) => true,
            (Running, Success) | (Running, Fail) => true,
            // launch gave up: retries exhausted or the request no longer validates
            (Preparing, Fail) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "CREATED"),
            TaskStatus::Preparing => write!(f, "PREPARING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Fail => write!(f, "FAIL"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Created,
    Running,
    Success,
    Fail,
    Canceled,
}

impl StepStatus {
    pub const ALL: [StepStatus; 5] = [
        StepStatus::Created,
        StepStatus::Running,
        StepStatus::Success,
        StepStatus::Fail,
        StepStatus::Canceled,
    ];
}

impl Lifecycle for StepStatus {
    const LEVEL: &'static str = "step";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Fail | StepStatus::Canceled
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Success)
                | (Running, Fail)
                | (Running, Canceled)
                // never started: job canceled or an upstream step failed
                | (Created, Canceled)
        )
    }
}

impl From<Derived> for StepStatus {
    fn from(derived: Derived) -> Self {
        match derived {
            Derived::Created => StepStatus::Created,
            Derived::Running => StepStatus::Running,
            Derived::Success => StepStatus::Success,
            Derived::Fail => StepStatus::Fail,
            Derived::Canceled => StepStatus::Canceled,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Created => write!(f, "CREATED"),
            StepStatus::Running => write!(f, "RUNNING"),
            StepStatus::Success => write!(f, "SUCCESS"),
            StepStatus::Fail => write!(f, "FAIL"),
            StepStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Created,
    Split,
    Scheduling,
    Running,
    Success,
    Fail,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Created,
        JobStatus::Split,
        JobStatus::Scheduling,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Fail,
        JobStatus::Canceled,
    ];

    /// The job-level reading of a calculator result. `Created` carries no
    /// information for a job that is already split or scheduling.
    pub fn from_derived(derived: Derived) -> Option<JobStatus> {
        match derived {
            Derived::Created => None,
            Derived::Running => Some(JobStatus::Running),
            Derived::Success => Some(JobStatus::Success),
            Derived::Fail => Some(JobStatus::Fail),
            Derived::Canceled => Some(JobStatus::Canceled),
        }
    }
}

impl Lifecycle for JobStatus {
    const LEVEL: &'static str = "job";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Fail | JobStatus::Canceled
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Created, Split) | (Split, Scheduling) | (Scheduling, Running) => true,
            (Running, Success) | (Running, Fail) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => write!(f, "CREATED"),
            JobStatus::Split => write!(f, "SPLIT"),
            JobStatus::Scheduling => write!(f, "SCHEDULING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Fail => write!(f, "FAIL"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Backend-observed status of one execution attempt.
///
/// On top of the task vocabulary this tracks the container/pod sub-states a
/// backend can report. [`RunStatus::task_view`] folds them back onto
/// [`TaskStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Created,
    Preparing,
    Running,
    Paused,
    Restarting,
    Removing,
    Success,
    Fail,
    Canceled,
    Dead,
    NoSuchContainer,
}

impl RunStatus {
    pub const ALL: [RunStatus; 11] = [
        RunStatus::Created,
        RunStatus::Preparing,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Restarting,
        RunStatus::Removing,
        RunStatus::Success,
        RunStatus::Fail,
        RunStatus::Canceled,
        RunStatus::Dead,
        RunStatus::NoSuchContainer,
    ];

    pub fn task_view(self) -> TaskStatus {
        match self {
            RunStatus::Created | RunStatus::Preparing => TaskStatus::Preparing,
            RunStatus::Running
            | RunStatus::Paused
            | RunStatus::Restarting
            | RunStatus::Removing => TaskStatus::Running,
            RunStatus::Success => TaskStatus::Success,
            RunStatus::Fail | RunStatus::Dead | RunStatus::NoSuchContainer => TaskStatus::Fail,
            RunStatus::Canceled => TaskStatus::Canceled,
        }
    }

    /// Whether a failed attempt may be retried with a fresh run.
    pub fn is_failure(self) -> bool {
        self.task_view() == TaskStatus::Fail
    }

    fn rank(self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Preparing => 1,
            RunStatus::Running | RunStatus::Paused | RunStatus::Restarting => 2,
            RunStatus::Removing => 3,
            _ => 4,
        }
    }
}

impl Lifecycle for RunStatus {
    const LEVEL: &'static str = "run";

    fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    /// Runs only move forward; the running sub-states may alternate among
    /// themselves (a container can be paused and resumed).
    fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        next.rank() > self.rank() || (self.rank() == 2 && next.rank() == 2)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "CREATED",
            RunStatus::Preparing => "PREPARING",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Restarting => "RESTARTING",
            RunStatus::Removing => "REMOVING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Fail => "FAIL",
            RunStatus::Canceled => "CANCELED",
            RunStatus::Dead => "DEAD",
            RunStatus::NoSuchContainer => "NO_SUCH_CONTAINER",
        };
        f.write_str(s)
    }
}
