//! Chunk definitions and the chunk status machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::job_status::UnknownStatus;
use crate::JobId;

/// Identifier of a chunk, derived from its job and sequence number so that
/// (job id, sequence) is unique by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Chunk id for `sequence` within `job_id`.
    pub fn for_sequence(job_id: &JobId, sequence: u32) -> Self {
        Self(format!("{}_{:05}", job_id.as_str(), sequence))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk processing status.
///
/// ```text
/// Pending -> Chunking -> AwaitingAnalysis -> Analyzing -> {Completed | Failed | RetryableFailed}
/// ```
///
/// Failed and RetryableFailed may re-enter Chunking on a later
/// orchestration pass. Analyzing may fall back to AwaitingAnalysis when a
/// stage claim loses its race, and re-enters itself on redelivery after a
/// crash mid-analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    #[default]
    Pending,
    Chunking,
    AwaitingAnalysis,
    Analyzing,
    Completed,
    Failed,
    RetryableFailed,
}

impl ChunkStatus {
    pub const ALL: [ChunkStatus; 7] = [
        ChunkStatus::Pending,
        ChunkStatus::Chunking,
        ChunkStatus::AwaitingAnalysis,
        ChunkStatus::Analyzing,
        ChunkStatus::Completed,
        ChunkStatus::Failed,
        ChunkStatus::RetryableFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Chunking => "chunking",
            ChunkStatus::AwaitingAnalysis => "awaiting_analysis",
            ChunkStatus::Analyzing => "analyzing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::RetryableFailed => "retryable_failed",
        }
    }

    /// Terminal for message redelivery: a worker acks without doing work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }

    /// Whether an orchestration pass should (re)split this chunk.
    pub fn needs_splitting(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Pending
                | ChunkStatus::Chunking
                | ChunkStatus::Failed
                | ChunkStatus::RetryableFailed
        )
    }

    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        match (self, next) {
            (Pending, Chunking | Completed) => true,
            (Chunking, AwaitingAnalysis | RetryableFailed | Failed | Chunking) => true,
            (AwaitingAnalysis, Analyzing | Failed) => true,
            (Analyzing, Analyzing | Completed | Failed | RetryableFailed | AwaitingAnalysis) => true,
            (Failed | RetryableFailed, Chunking) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChunkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// One time-bounded, overlapping segment of a job's video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Chunk {
    pub id: ChunkId,
    pub job_id: JobId,
    /// 0-based, contiguous within a job
    pub sequence: u32,
    /// Offset into the source video, in seconds
    pub start_secs: f64,
    pub duration_secs: f64,
    /// Materialized segment; empty until split
    #[serde(default)]
    pub artifact_path: String,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Opaque token returned by the analysis call, fed to the next chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    /// Raw analysis response kept for audit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    /// When this chunk last entered ANALYZING; orders stage claims
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a pending chunk.
    pub fn new(job_id: JobId, sequence: u32, start_secs: f64, duration_secs: f64) -> Self {
        let now = Utc::now();
        Self {
            id: ChunkId::for_sequence(&job_id, sequence),
            job_id,
            sequence,
            start_secs,
            duration_secs,
            artifact_path: String::new(),
            status: ChunkStatus::Pending,
            failure_reason: None,
            continuation_token: None,
            raw_response: None,
            analysis_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// End of the window in source-video seconds.
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }

    /// Update the status and bump `updated_at`.
    pub fn set_status(&mut self, status: ChunkStatus) {
        let now = Utc::now();
        if status == ChunkStatus::Analyzing {
            self.analysis_started_at = Some(now);
        }
        if matches!(status, ChunkStatus::Chunking | ChunkStatus::Completed) {
            self.failure_reason = None;
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Set a failure status with its reason.
    pub fn fail(&mut self, status: ChunkStatus, reason: impl Into<String>) {
        self.set_status(status);
        self.failure_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_zero_padded() {
        let job = JobId::from_string("job_abc");
        assert_eq!(ChunkId::for_sequence(&job, 7).as_str(), "job_abc_00007");
        // Lexicographic order matches sequence order
        assert!(ChunkId::for_sequence(&job, 9) < ChunkId::for_sequence(&job, 10));
    }

    #[test]
    fn test_chunk_transitions() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(Chunking));
        assert!(Chunking.can_transition_to(AwaitingAnalysis));
        assert!(AwaitingAnalysis.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Completed));
        assert!(RetryableFailed.can_transition_to(Chunking));
        assert!(Failed.can_transition_to(Chunking));
        assert!(!Completed.can_transition_to(Analyzing));
        assert!(!Pending.can_transition_to(Analyzing));
    }

    #[test]
    fn test_analyzing_records_start_time() {
        let mut chunk = Chunk::new(JobId::from_string("job_abc"), 0, 0.0, 150.0);
        assert!(chunk.analysis_started_at.is_none());
        chunk.set_status(ChunkStatus::Analyzing);
        assert!(chunk.analysis_started_at.is_some());
    }

    #[test]
    fn test_resplit_clears_failure() {
        let mut chunk = Chunk::new(JobId::from_string("job_abc"), 1, 120.0, 150.0);
        chunk.fail(ChunkStatus::RetryableFailed, "ffmpeg exited with 1");
        assert!(chunk.status.needs_splitting());
        chunk.set_status(ChunkStatus::Chunking);
        assert!(chunk.failure_reason.is_none());
        assert_eq!(chunk.end_secs(), 270.0);
    }
}
