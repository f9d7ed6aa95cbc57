//! Job definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::digest_parts;
use crate::{JobStatus, VideoId};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Deterministic id for a (video, source path) pair.
    ///
    /// Creating a job row under this id is what makes "one job per video
    /// source" hold: a second create for the same pair conflicts.
    pub fn for_source(video_id: &VideoId, source_path: &str) -> Self {
        let digest = digest_parts(&["job", video_id.as_str(), source_path]);
        Self(format!("job_{}", &digest[..32]))
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

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One end-to-end analysis request for a video.
///
/// Accumulated events and entities are stored as child records keyed by
/// job id, not on the job row itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Video being analysed
    pub video_id: VideoId,

    /// Location of the source video
    pub source_path: String,

    /// Submitting user
    pub user_id: String,

    /// Current status
    #[serde(default)]
    pub status: JobStatus,

    /// Reason for the last failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Number of orchestration passes started after RETRYABLE_FAILED
    #[serde(default)]
    pub retry_count: u32,

    /// Last liveness signal from a worker touching this job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Terminal transition timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job for a video source.
    pub fn new(video_id: VideoId, source_path: impl Into<String>, user_id: impl Into<String>) -> Self {
        let source_path = source_path.into();
        let now = Utc::now();
        Self {
            id: JobId::for_source(&video_id, &source_path),
            video_id,
            source_path,
            user_id: user_id.into(),
            status: JobStatus::Pending,
            failure_reason: None,
            retry_count: 0,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Update the status, stamping `completed_at` on terminal transitions.
    pub fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    /// Mark as failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.set_status(JobStatus::Failed);
    }

    /// Update heartbeat timestamp.
    pub fn record_heartbeat(&mut self) {
        let now = Utc::now();
        self.last_heartbeat = Some(now);
        self.updated_at = now;
    }

    /// Whether the job is PROCESSING with no liveness signal for longer
    /// than `threshold_secs`. Jobs that never heartbeated are measured from
    /// their creation time.
    pub fn is_stale(&self, threshold_secs: i64, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let last_seen = self.last_heartbeat.unwrap_or(self.created_at);
        (now - last_seen).num_seconds() > threshold_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_job_id_is_deterministic() {
        let video = VideoId::from("match-42");
        let a = JobId::for_source(&video, "gs://bucket/match-42.mp4");
        let b = JobId::for_source(&video, "gs://bucket/match-42.mp4");
        let c = JobId::for_source(&video, "gs://bucket/match-42-replay.mp4");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("job_"));
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(VideoId::from("v1"), "/videos/v1.mp4", "user-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.id, JobId::for_source(&job.video_id, "/videos/v1.mp4"));
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_terminal_status_stamps_completion() {
        let mut job = Job::new(VideoId::from("v1"), "/videos/v1.mp4", "user-1");
        job.set_status(JobStatus::Processing);
        assert!(job.completed_at.is_none());

        job.fail("chunk 2 failed");
        assert!(job.is_terminal());
        assert!(job.completed_at.is_some());
        assert_eq!(job.failure_reason.as_deref(), Some("chunk 2 failed"));
    }

    #[test]
    fn test_stale_detection() {
        let mut job = Job::new(VideoId::from("v1"), "/videos/v1.mp4", "user-1");
        let now = Utc::now();

        // Only PROCESSING jobs can be stale
        job.created_at = now - Duration::seconds(500);
        assert!(!job.is_stale(60, now));

        job.set_status(JobStatus::Processing);
        assert!(job.is_stale(60, now));

        job.last_heartbeat = Some(now - Duration::seconds(10));
        assert!(!job.is_stale(60, now));

        job.last_heartbeat = Some(now - Duration::seconds(120));
        assert!(job.is_stale(60, now));
    }
}
