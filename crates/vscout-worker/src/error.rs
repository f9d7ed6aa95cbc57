//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by the job/chunk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The row changed since it was read, or the transition is not allowed
    /// from the stored status.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("Firestore error: {0}")]
    Firestore(#[from] vscout_firestore::FirestoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn illegal_transition(id: impl ToString, from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Firestore(e) => e.is_precondition_failed(),
            _ => false,
        }
    }

    /// A row that kept changing under us is contention, not bad input.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Firestore(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Media error: {0}")]
    Media(#[from] vscout_media::MediaError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] vscout_ml_client::MlError),

    #[error("Queue error: {0}")]
    Queue(#[from] vscout_queue::QueueError),

    #[error("Planning error: {0}")]
    Planning(#[from] vscout_models::PlanningError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    /// Whether a later attempt may succeed without any change to the input.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Media(e) => e.is_retryable(),
            WorkerError::Analysis(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<vscout_firestore::FirestoreError> for WorkerError {
    fn from(e: vscout_firestore::FirestoreError) -> Self {
        WorkerError::Store(StoreError::Firestore(e))
    }
}
