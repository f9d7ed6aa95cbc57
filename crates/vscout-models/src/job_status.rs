//! Job status machine.
//!
//! ```text
//! Pending -> Processing -> {Completed | Failed}
//!                 ^   \
//!                 |    v
//!           RetryableFailed
//! ```
//!
//! Completed and Failed are terminal. A job may bounce between
//! Processing and RetryableFailed any number of times.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job row exists but no orchestration pass has started
    #[default]
    Pending,
    /// Chunks are being planned, split or analysed
    Processing,
    /// Work stalled or a chunk hit a transient error; eligible for a new pass
    RetryableFailed,
    /// Every chunk completed
    Completed,
    /// At least one chunk failed permanently
    Failed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::RetryableFailed,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::RetryableFailed => "retryable_failed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (Pending, Processing | Failed) => true,
            (Processing, RetryableFailed | Completed | Failed) => true,
            (RetryableFailed, Processing | Completed | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
