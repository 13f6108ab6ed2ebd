use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PlaneError {
    /// A resource request, spec, or transition precondition was rejected.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {0} has already been split")]
    AlreadySplit(Uuid),

    #[error("Illegal {level} transition {from} -> {to}")]
    IllegalTransition {
        level: &'static str,
        from: String,
        to: String,
    },

    /// The execution backend was unreachable or refused a request.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Checkpoint persistence or another piece of infrastructure failed.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Step not found: {0}")]
    StepNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaneError {
    pub fn is_validation(&self) -> bool {
        matches!(self, PlaneError::Validation(_) | PlaneError::PoolNotFound(_))
    }

    /// Infrastructure failures must reach the caller of a pipeline tick.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, PlaneError::Infrastructure(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PlaneError::JobNotFound(_)
                | PlaneError::StepNotFound(_)
                | PlaneError::TaskNotFound(_)
                | PlaneError::RunNotFound(_)
                | PlaneError::PoolNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlaneError>;
