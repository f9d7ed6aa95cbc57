//! Integration tests against a live Redis (REDIS_URL, default localhost).
//!
//! Run with `cargo test -p vscout-queue -- --ignored`.

use std::time::Duration;

use uuid::Uuid;
use vscout_models::{ChunkId, JobId, VideoId};
use vscout_queue::{AnalyzeChunk, Channel, MessageQueue, NackOutcome, QueueConfig, SubmitVideo};

fn isolated_queue(max_deliveries: u32) -> MessageQueue {
    let config = QueueConfig {
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
        prefix: format!("vscout-test-{}", Uuid::new_v4()),
        consumer_group: "test-workers".into(),
        ack_deadline: Duration::from_millis(50),
        nack_base_delay: Duration::from_millis(1),
        nack_max_delay: Duration::from_millis(5),
        max_deliveries,
        read_block: Duration::from_millis(50),
    };
    MessageQueue::new(config).unwrap()
}

fn analyze_message(seq: u32) -> AnalyzeChunk {
    let job_id = JobId::from_string("job_it");
    AnalyzeChunk {
        chunk_id: ChunkId::for_sequence(&job_id, seq),
        job_id,
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn publish_consume_ack() {
    let queue = isolated_queue(5);
    queue.init().await.unwrap();

    queue.publish(&analyze_message(0)).await.unwrap();
    let deliveries = queue.consume::<AnalyzeChunk>("c1", 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].attempt, 0);

    queue.ack(Channel::Analyze, &deliveries[0].message_id).await.unwrap();
    assert_eq!(queue.len(Channel::Analyze).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn nack_redelivers_with_bumped_attempt() {
    let queue = isolated_queue(5);
    queue.init().await.unwrap();
    queue.publish(&analyze_message(1)).await.unwrap();

    let first = queue.consume::<AnalyzeChunk>("c1", 1).await.unwrap().remove(0);
    let outcome = queue.nack(&first, "gated").await.unwrap();
    assert!(matches!(outcome, NackOutcome::Delayed(_)));
    assert_eq!(queue.delayed_len().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.promote_delayed(10).await.unwrap(), 1);

    let second = queue.consume::<AnalyzeChunk>("c1", 1).await.unwrap().remove(0);
    assert_eq!(second.attempt, 1);
    assert_eq!(second.message, first.message);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn nack_past_bound_dead_letters() {
    let queue = isolated_queue(1);
    queue.init().await.unwrap();
    queue.publish(&analyze_message(2)).await.unwrap();

    let delivery = queue.consume::<AnalyzeChunk>("c1", 1).await.unwrap().remove(0);
    assert_eq!(queue.nack(&delivery, "gated").await.unwrap(), NackOutcome::DeadLettered);
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
    assert_eq!(queue.delayed_len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn idle_messages_are_claimed_by_another_consumer() {
    let queue = isolated_queue(5);
    queue.init().await.unwrap();
    queue
        .publish(&SubmitVideo::new(VideoId::from("v"), "/v.mp4", "u"))
        .await
        .unwrap();

    let taken = queue.consume::<SubmitVideo>("crashed", 1).await.unwrap();
    assert_eq!(taken.len(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let claimed = queue.claim_pending::<SubmitVideo>("survivor", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].message_id, taken[0].message_id);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn extended_deadline_prevents_claim() {
    let queue = isolated_queue(5);
    queue.init().await.unwrap();
    queue.publish(&analyze_message(3)).await.unwrap();

    let taken = queue.consume::<AnalyzeChunk>("busy", 1).await.unwrap().remove(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue
        .extend_deadline(Channel::Analyze, "busy", &taken.message_id)
        .await
        .unwrap();

    let claimed = queue.claim_pending::<AnalyzeChunk>("other", 10).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn malformed_payload_is_dead_lettered() {
    let queue = isolated_queue(5);
    queue.init().await.unwrap();

    let client = redis::Client::open(queue.config().redis_url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("XADD")
        .arg(queue.config().stream_key(Channel::Analyze))
        .arg("*")
        .arg("payload")
        .arg("{broken")
        .query_async::<()>(&mut conn)
        .await
        .unwrap();

    let deliveries = queue.consume::<AnalyzeChunk>("c1", 10).await.unwrap();
    assert!(deliveries.is_empty());
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
}
