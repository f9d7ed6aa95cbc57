//! Shared data models for the vscout analysis pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their status machine
//! - Chunks, chunk planning and the chunk status machine
//! - Raw and processed gameplay events
//! - Deterministic team/player entity identities
//! - Timestamp parsing helpers

pub mod chunk;
pub mod entity;
pub mod event;
pub mod job;
pub mod job_status;
pub mod mode;
pub mod planning;
pub mod timestamp;
pub mod utils;
pub mod video;

// Re-export common types
pub use chunk::{Chunk, ChunkId, ChunkStatus};
pub use entity::{EntityKind, IdentifiedEntity};
pub use event::{sort_by_timeline, EventType, ProcessedEvent, RawEvent, UnknownEventType};
pub use job::{Job, JobId};
pub use job_status::{JobStatus, UnknownStatus};
pub use mode::{ProcessingMode, UnknownProcessingMode};
pub use planning::{plan_chunks, PlannedChunk, PlanningError};
pub use timestamp::{format_seconds, parse_timestamp, TimestampError};
pub use video::VideoId;
