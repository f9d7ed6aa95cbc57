//! Analysis service request/response types.

use serde::{Deserialize, Serialize};
use vscout_models::{IdentifiedEntity, RawEvent};

/// Input for one chunk analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Materialized chunk segment
    pub artifact_path: String,
    pub chunk_sequence: u32,
    /// Entities already identified for the job
    #[serde(default)]
    pub known_entities: Vec<IdentifiedEntity>,
    /// Token returned by the previous chunk (sequential mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// Successful analysis of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResponse {
    pub events: Vec<RawEvent>,
    pub continuation_token: Option<String>,
    /// Body of the settling response, kept for audit
    pub raw_response: String,
}

/// Body returned by a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

/// Remote task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Body returned when polling a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub status: TaskState,
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: Option<String>,
}
