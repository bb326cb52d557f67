//! Durable event buffer backed by Redis Streams: at-least-once delivery,
//! consumer-group partitioned consumption, pending-entry reclaim for
//! crashed workers, and a dead-letter stream for records that repeatedly
//! fail processing.

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::core::NormalizedEvent;
use crate::err::{EleanorError, Result};

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub event: NormalizedEvent,
    pub delivery_count: u32,
}

pub struct EventBuffer {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
    dlq_key: String,
    max_delivery_attempts: u32,
}

impl EventBuffer {
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        dlq_suffix: &str,
        max_delivery_attempts: u32,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(EleanorError::Redis)?;
        let conn = ConnectionManager::new(client).await.map_err(EleanorError::Redis)?;
        let stream_key = stream_key.into();
        let dlq_key = format!("{stream_key}{dlq_suffix}");
        let buffer = Self {
            conn,
            stream_key,
            group: group.into(),
            consumer: consumer.into(),
            dlq_key,
            max_delivery_attempts,
        };
        buffer.ensure_group().await?;
        Ok(buffer)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(EleanorError::Redis(e)),
        }
    }

    /// Publishes a single normalized event onto the stream. Total order is
    /// per-stream; consumption order is partitioned per consumer group.
    pub async fn publish(&self, event: &NormalizedEvent) -> Result<String> {
        self.publish_payload(event).await
    }

    /// Publishes any serializable payload under the `event_data` field.
    /// Used for the `alerts` and `correlation` streams as well as `events`.
    pub async fn publish_payload<T: serde::Serialize>(&self, payload: &T) -> Result<String> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(&self.stream_key, "*", &[("event_data", payload)]).await.map_err(EleanorError::Redis)?;
        Ok(id)
    }

    /// Reads up to `count` undelivered messages for this consumer, blocking
    /// up to `block_ms` milliseconds if none are immediately available.
    pub async fn consume(&self, count: usize, block_ms: u64) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[self.stream_key.as_str()], &[">"], &opts)
            .await
            .map_err(EleanorError::Redis)?;

        self.decode_reply(reply)
    }

    /// Claims messages that have been pending for at least `min_idle_ms`,
    /// for recovery after a worker crash.
    pub async fn claim_pending(&self, min_idle_ms: u64, count: usize) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", count)
            .await
            .map_err(EleanorError::Redis)?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.time_since_delivered >= min_idle_ms as usize)
            .map(|p| p.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamReadReply = conn
            .xclaim(&self.stream_key, &self.group, &self.consumer, min_idle_ms as usize, &stale_ids)
            .await
            .map_err(EleanorError::Redis)?;

        self.decode_reply(claimed)
    }

    fn decode_reply(&self, reply: StreamReadReply) -> Result<Vec<StreamMessage>> {
        let mut out = Vec::new();
        for key in reply.keys {
            for id_entry in key.ids {
                let payload: Option<String> = id_entry.map.get("event_data").and_then(|v| match v {
                    redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
                    redis::Value::Status(s) => Some(s.clone()),
                    _ => None,
                });
                let Some(payload) = payload else { continue };
                match serde_json::from_str::<NormalizedEvent>(&payload) {
                    Ok(event) => out.push(StreamMessage {
                        id: id_entry.id.clone(),
                        event,
                        delivery_count: 1,
                    }),
                    Err(e) => tracing::warn!(id = %id_entry.id, error = %e, "dropping unparseable stream message"),
                }
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.stream_key, &self.group, ids).await.map_err(EleanorError::Redis)?;
        Ok(())
    }

    /// Moves a message to the dead-letter stream after it has exceeded
    /// `max_delivery_attempts`, then acks it off the main stream.
    pub async fn move_to_dlq(&self, message: &StreamMessage, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&message.event)?;
        let _: String = conn
            .xadd(
                &self.dlq_key,
                "*",
                &[("event_data", payload.as_str()), ("reason", reason), ("original_id", message.id.as_str())],
            )
            .await
            .map_err(EleanorError::Redis)?;
        self.ack(&[message.id.clone()]).await
    }

    pub fn should_dlq(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_delivery_attempts
    }
}
