//! Publishing seam between the pipeline and the transport.

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::message::{AnalyzeChunk, JobResult, SubmitVideo};
use crate::queue::MessageQueue;

/// Outbound side of the transport as seen by the pipeline components.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_submit(&self, message: &SubmitVideo) -> QueueResult<String>;

    async fn publish_analyze(&self, message: &AnalyzeChunk) -> QueueResult<String>;

    async fn publish_result(&self, message: &JobResult) -> QueueResult<String>;
}

#[async_trait]
impl MessagePublisher for MessageQueue {
    async fn publish_submit(&self, message: &SubmitVideo) -> QueueResult<String> {
        self.publish(message).await
    }

    async fn publish_analyze(&self, message: &AnalyzeChunk) -> QueueResult<String> {
        self.publish(message).await
    }

    async fn publish_result(&self, message: &JobResult) -> QueueResult<String> {
        self.publish(message).await
    }
}
