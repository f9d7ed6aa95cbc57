//! Message queue on Redis Streams.
//!
//! Each channel is a stream read through one consumer group. Nacked
//! messages are acked and parked in a sorted set scored by their due time;
//! a promoter moves due entries back onto their stream with the attempt
//! counter bumped. Past `max_deliveries` a message goes to the DLQ stream.

use std::time::Duration;

use chrono::Utc;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::message::{Channel, Delivery, QueueMessage};

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPT_FIELD: &str = "attempt";

/// Atomically pops due entries from the delayed set and re-adds them to
/// their streams. Returns the number promoted.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    local entry = cjson.decode(member)
    redis.call('XADD', entry.stream, '*', 'payload', entry.payload, 'attempt', tostring(entry.attempt))
end
return #due
"#;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Key prefix for every stream and set
    pub prefix: String,
    pub consumer_group: String,
    /// Idle time after which a pending message counts as abandoned
    pub ack_deadline: Duration,
    /// First nack delay; doubles per attempt
    pub nack_base_delay: Duration,
    pub nack_max_delay: Duration,
    /// Deliveries after which a nacked message is dead-lettered
    pub max_deliveries: u32,
    /// How long a consume call blocks waiting for messages
    pub read_block: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "vscout".to_string(),
            consumer_group: "vscout:workers".to_string(),
            ack_deadline: Duration::from_secs(600),
            nack_base_delay: Duration::from_millis(1000),
            nack_max_delay: Duration::from_millis(30_000),
            max_deliveries: 500,
            read_block: Duration::from_millis(1000),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let num = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            ack_deadline: num("QUEUE_ACK_DEADLINE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ack_deadline),
            nack_base_delay: num("QUEUE_NACK_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.nack_base_delay),
            nack_max_delay: num("QUEUE_NACK_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.nack_max_delay),
            max_deliveries: num("QUEUE_MAX_DELIVERIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_deliveries),
            read_block: num("QUEUE_READ_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_block),
        }
    }

    pub fn stream_key(&self, channel: Channel) -> String {
        format!("{}:{}", self.prefix, channel.name())
    }

    pub fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    pub fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Redelivery delay after the nack of delivery number `attempt`.
    pub fn nack_delay(&self, attempt: u32) -> Duration {
        let base = self.nack_base_delay.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(32));
        Duration::from_millis(delay.min(self.nack_max_delay.as_millis() as u64))
    }
}

/// What a nack did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Parked for redelivery after the delay.
    Delayed(Duration),
    DeadLettered,
}

#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    stream: String,
    payload: String,
    attempt: u32,
    /// Keeps identical payloads distinct in the sorted set.
    nonce: String,
}

/// Redis Streams message queue.
pub struct MessageQueue {
    client: redis::Client,
    config: QueueConfig,
    promote_script: redis::Script,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::connection_failed(format!("invalid REDIS_URL: {}", e)))?;
        Ok(Self {
            client,
            config,
            promote_script: redis::Script::new(PROMOTE_SCRIPT),
        })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create the consumer groups for the consumed channels.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        for channel in [Channel::Intake, Channel::Analyze] {
            let stream = self.config.stream_key(channel);
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(()) => info!(stream = %stream, group = %self.config.consumer_group, "Created consumer group"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, "Consumer group already exists");
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    /// Append a message to its channel. Returns the stream entry id.
    pub async fn publish<M: QueueMessage>(&self, message: &M) -> QueueResult<String> {
        let payload = serde_json::to_string(message)?;
        let stream = self.config.stream_key(M::CHANNEL);
        let mut conn = self.conn().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .arg(ATTEMPT_FIELD)
            .arg(0u32)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %stream, message_id = %message_id, "Published {}", message.describe());
        Ok(message_id)
    }

    /// Read new messages for `consumer`. Malformed entries are dead-lettered
    /// and left out of the result.
    pub async fn consume<M: QueueMessage>(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery<M>>> {
        let stream = self.config.stream_key(M::CHANNEL);
        let mut conn = self.conn().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.config.read_block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();
        self.decode_all(entries).await
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, channel: Channel, message_id: &str) -> QueueResult<()> {
        let stream = self.config.stream_key(channel);
        let mut conn = self.conn().await?;

        redis::pipe()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(stream = %stream, message_id = %message_id, "Acknowledged");
        Ok(())
    }

    /// Schedule redelivery with backoff, or dead-letter once the delivery
    /// bound is reached. The original entry is acked either way.
    pub async fn nack<M: QueueMessage>(&self, delivery: &Delivery<M>, reason: &str) -> QueueResult<NackOutcome> {
        let next_attempt = delivery.attempt.saturating_add(1);
        if next_attempt >= self.config.max_deliveries {
            self.dead_letter(M::CHANNEL, &delivery.message_id, &delivery.payload, reason)
                .await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self.config.nack_delay(delivery.attempt);
        let entry = DelayedEntry {
            stream: self.config.stream_key(M::CHANNEL),
            payload: delivery.payload.clone(),
            attempt: next_attempt,
            nonce: Uuid::new_v4().to_string(),
        };
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(self.config.delayed_key(), serde_json::to_string(&entry)?, due_ms)
            .await?;
        self.ack(M::CHANNEL, &delivery.message_id).await?;

        debug!(
            message_id = %delivery.message_id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Nacked {}",
            delivery.message.describe()
        );
        Ok(NackOutcome::Delayed(delay))
    }

    /// Move up to `limit` due delayed messages back onto their streams.
    pub async fn promote_delayed(&self, limit: usize) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let promoted: usize = self
            .promote_script
            .key(self.config.delayed_key())
            .arg(Utc::now().timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "Promoted delayed messages");
        }
        Ok(promoted)
    }

    /// Reset the idle time of a message this consumer is still working on,
    /// so the claim sweep does not hand it to another consumer.
    pub async fn extend_deadline(&self, channel: Channel, consumer: &str, message_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.config.stream_key(channel))
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        if claimed.is_empty() {
            warn!(message_id = %message_id, "Deadline extension found no pending entry");
        }
        Ok(())
    }

    /// Take over messages pending longer than the ack deadline (their
    /// consumer likely crashed).
    pub async fn claim_pending<M: QueueMessage>(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery<M>>> {
        let stream = self.config.stream_key(M::CHANNEL);
        let min_idle_ms = self.config.ack_deadline.as_millis() as u64;
        let mut conn = self.conn().await?;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        if !claimed.ids.is_empty() {
            info!(stream = %stream, count = claimed.ids.len(), "Claimed idle pending messages");
        }
        self.decode_all(claimed.ids).await
    }

    /// Copy a message to the DLQ stream with the reason, then ack it.
    pub async fn dead_letter(&self, channel: Channel, message_id: &str, payload: &str, reason: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("XADD")
            .arg(self.config.dlq_key())
            .arg("*")
            .arg("stream")
            .arg(self.config.stream_key(channel))
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg("error")
            .arg(reason)
            .arg("original_id")
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(channel, message_id).await?;
        warn!(channel = %channel, message_id = %message_id, reason = %reason, "Moved message to DLQ");
        Ok(())
    }

    pub async fn len(&self, channel: Channel) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(self.config.stream_key(channel)).await?)
    }

    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(self.config.dlq_key()).await?)
    }

    pub async fn delayed_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(self.config.delayed_key()).await?)
    }

    async fn decode_all<M: QueueMessage>(&self, entries: Vec<StreamId>) -> QueueResult<Vec<Delivery<M>>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry::<M>(&entry) {
                Ok(delivery) => deliveries.push(delivery),
                Err(QueueError::Malformed { message_id, reason }) => {
                    warn!(message_id = %message_id, "Dropping malformed message: {}", reason);
                    let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                    self.dead_letter(M::CHANNEL, &message_id, &payload, &reason).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deliveries)
    }
}

fn decode_entry<M: QueueMessage>(entry: &StreamId) -> QueueResult<Delivery<M>> {
    let malformed = |reason: String| QueueError::Malformed {
        message_id: entry.id.clone(),
        reason,
    };

    let payload: String = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| malformed("missing payload field".to_string()))?;
    let message: M = serde_json::from_str(&payload).map_err(|e| malformed(e.to_string()))?;

    Ok(Delivery {
        message_id: entry.id.clone(),
        attempt: entry.get(ATTEMPT_FIELD).unwrap_or(0),
        payload,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AnalyzeChunk;
    use serial_test::serial;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn test_nack_delay_doubles_and_caps() {
        let config = QueueConfig::default();
        assert_eq!(config.nack_delay(0), Duration::from_millis(1000));
        assert_eq!(config.nack_delay(1), Duration::from_millis(2000));
        assert_eq!(config.nack_delay(4), Duration::from_millis(16_000));
        assert_eq!(config.nack_delay(5), Duration::from_millis(30_000));
        assert_eq!(config.nack_delay(400), Duration::from_millis(30_000));
    }

    #[test]
    fn test_keys_use_prefix() {
        let config = QueueConfig {
            prefix: "test".into(),
            ..Default::default()
        };
        assert_eq!(config.stream_key(Channel::Intake), "test:intake");
        assert_eq!(config.stream_key(Channel::Analyze), "test:analyze");
        assert_eq!(config.dlq_key(), "test:dlq");
        assert_eq!(config.delayed_key(), "test:delayed");
    }

    #[test]
    fn test_decode_entry_reads_attempt() {
        let raw = entry(&[
            ("payload", r#"{"job_id":"job_1","chunk_id":"job_1_00002"}"#),
            ("attempt", "3"),
        ]);
        let delivery = decode_entry::<AnalyzeChunk>(&raw).unwrap();
        assert_eq!(delivery.attempt, 3);
        assert_eq!(delivery.message.chunk_id.as_str(), "job_1_00002");
    }

    #[test]
    fn test_decode_entry_defaults_attempt() {
        let raw = entry(&[("payload", r#"{"job_id":"job_1","chunk_id":"job_1_00000"}"#)]);
        assert_eq!(decode_entry::<AnalyzeChunk>(&raw).unwrap().attempt, 0);
    }

    #[test]
    fn test_decode_entry_rejects_garbage() {
        let raw = entry(&[("payload", "{not json")]);
        assert!(matches!(
            decode_entry::<AnalyzeChunk>(&raw),
            Err(QueueError::Malformed { .. })
        ));
        let missing = entry(&[("job", "{}")]);
        assert!(matches!(
            decode_entry::<AnalyzeChunk>(&missing),
            Err(QueueError::Malformed { .. })
        ));
    }

    #[test]
    fn test_delayed_entry_shape_matches_script() {
        let entry = DelayedEntry {
            stream: "vscout:analyze".into(),
            payload: "{}".into(),
            attempt: 2,
            nonce: "n".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        for field in ["stream", "payload", "attempt"] {
            assert!(value.get(field).is_some(), "{field}");
            assert!(PROMOTE_SCRIPT.contains(&format!("entry.{field}")));
        }
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("QUEUE_PREFIX", "stage");
        std::env::set_var("QUEUE_ACK_DEADLINE_SECS", "120");
        std::env::set_var("QUEUE_NACK_BASE_DELAY_MS", "250");
        std::env::set_var("QUEUE_MAX_DELIVERIES", "7");

        let config = QueueConfig::from_env();
        assert_eq!(config.prefix, "stage");
        assert_eq!(config.ack_deadline, Duration::from_secs(120));
        assert_eq!(config.nack_base_delay, Duration::from_millis(250));
        assert_eq!(config.nack_max_delay, Duration::from_millis(30_000));
        assert_eq!(config.max_deliveries, 7);

        for key in [
            "QUEUE_PREFIX",
            "QUEUE_ACK_DEADLINE_SECS",
            "QUEUE_NACK_BASE_DELAY_MS",
            "QUEUE_MAX_DELIVERIES",
        ] {
            std::env::remove_var(key);
        }
    }
}
