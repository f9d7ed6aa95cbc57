//! Message types carried on the pipeline's streams.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use vscout_models::{ChunkId, JobId, JobStatus, ProcessedEvent, VideoId};

/// A logical stream. The physical key is `{prefix}:{name}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Video submissions, consumed by the orchestrator.
    Intake,
    /// One message per chunk ready for analysis.
    Analyze,
    /// Terminal job outcomes, consumed outside the worker.
    Results,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Intake => "intake",
            Channel::Analyze => "analyze",
            Channel::Results => "results",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload bound to the channel it travels on.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CHANNEL: Channel;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Request to analyze a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubmitVideo {
    pub video_id: VideoId,
    pub source_path: String,
    pub user_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl SubmitVideo {
    pub fn new(video_id: VideoId, source_path: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            video_id,
            source_path: source_path.into(),
            user_id: user_id.into(),
            submitted_at: Utc::now(),
        }
    }

    /// The job this submission maps to.
    pub fn job_id(&self) -> JobId {
        JobId::for_source(&self.video_id, &self.source_path)
    }
}

impl QueueMessage for SubmitVideo {
    const CHANNEL: Channel = Channel::Intake;

    fn describe(&self) -> String {
        format!("submit {} ({})", self.video_id, self.source_path)
    }
}

/// A chunk whose artifact is ready for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AnalyzeChunk {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
}

impl QueueMessage for AnalyzeChunk {
    const CHANNEL: Channel = Channel::Analyze;

    fn describe(&self) -> String {
        format!("analyze {}", self.chunk_id)
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    pub job_id: JobId,
    pub video_id: VideoId,
    pub user_id: String,
    pub status: JobStatus,
    /// Accepted events ordered by absolute timestamp; only on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<ProcessedEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl QueueMessage for JobResult {
    const CHANNEL: Channel = Channel::Results;

    fn describe(&self) -> String {
        format!("result {} {}", self.job_id, self.status)
    }
}

/// A message read from a stream, with its delivery metadata.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub message_id: String,
    /// Times this payload has been nacked and redelivered.
    pub attempt: u32,
    /// Serialized payload, kept for redelivery and dead-lettering.
    pub payload: String,
    pub message: M,
}

impl<M: QueueMessage> Delivery<M> {
    pub fn channel(&self) -> Channel {
        M::CHANNEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_maps_to_deterministic_job() {
        let a = SubmitVideo::new(VideoId::from("m1"), "gs://b/m1.mp4", "u1");
        let b = SubmitVideo::new(VideoId::from("m1"), "gs://b/m1.mp4", "u2");
        assert_eq!(a.job_id(), b.job_id());
    }

    #[test]
    fn test_analyze_chunk_wire_shape() {
        let job_id = JobId::from_string("job_1");
        let msg = AnalyzeChunk {
            chunk_id: ChunkId::for_sequence(&job_id, 4),
            job_id,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"job_id": "job_1", "chunk_id": "job_1_00004"})
        );
    }

    #[test]
    fn test_failed_result_omits_events() {
        let result = JobResult {
            job_id: JobId::from_string("job_1"),
            video_id: VideoId::from("v"),
            user_id: "u".into(),
            status: JobStatus::Failed,
            events: None,
            failure_reason: Some("1 chunk(s) failed: chunk 2: rejected".into()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert!(value.get("events").is_none());
    }

    #[test]
    fn test_channels() {
        assert_eq!(SubmitVideo::CHANNEL, Channel::Intake);
        assert_eq!(AnalyzeChunk::CHANNEL.name(), "analyze");
        assert_eq!(JobResult::CHANNEL.to_string(), "results");
    }
}
