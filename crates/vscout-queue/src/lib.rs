//! Redis Streams transport for the analysis pipeline.
//!
//! This crate provides:
//! - Typed messages for the intake, analyze and results channels
//! - Consumer-group delivery with explicit ack
//! - Nack with exponential-backoff redelivery through a delayed set,
//!   dead-lettering after a delivery bound
//! - Deadline extension and crash recovery of idle pending messages
//! - The `MessagePublisher` seam used by the pipeline

pub mod error;
pub mod message;
pub mod publisher;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use message::{AnalyzeChunk, Channel, Delivery, JobResult, QueueMessage, SubmitVideo};
pub use publisher::MessagePublisher;
pub use queue::{MessageQueue, NackOutcome, QueueConfig};
