//! The unit graph: Jobs own Steps, Steps own Tasks, Tasks own one Run per
//! attempt.

pub mod job;
pub mod run;
pub mod split;
pub mod step;
pub mod store;
pub mod task;

use uuid::Uuid;

pub type JobId = Uuid;
pub type StepId = Uuid;
pub type TaskId = Uuid;
pub type RunId = Uuid;

pub use job::{Dataset, Job, JobSpec, Partition, StepSpec};
pub use run::{Run, RunSpec};
pub use split::{partition, DataSlice};
pub use step::Step;
pub use store::{JobDetail, UnitStore};
pub use task::Task;
