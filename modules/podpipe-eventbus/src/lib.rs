//! The event bus: durable streams with consumer groups, plus a
//! non-durable pub/sub channel for control signals.
//!
//! Every published event carries `event_id`, a timestamp, the originating
//! service, and (except `BatchTranscribed`) an `episode_id` — see
//! [`podpipe_common::event::Event`]. This crate only knows about streams and
//! entries; it decodes `Event` at the boundary so nothing downstream sees a
//! raw field map.

use std::time::Duration;

use podpipe_common::event::Event;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type EventBusResult<T> = std::result::Result<T, EventBusError>;

/// A single field in a stream entry: events are stored as one `payload`
/// field holding the JSON-encoded [`Event`] — a one-field map rather than
/// exploding every variant's fields onto the wire.
const PAYLOAD_FIELD: &str = "payload";

/// An entry read off a stream, still carrying its id for acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: String,
    pub event: Event,
}

/// Typed publish/subscribe over named Redis streams.
#[derive(Clone)]
pub struct EventBus {
    conn: ConnectionManager,
}

impl EventBus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Append `event` to `stream`. Fails soft: logs and returns `false`
    /// rather than raising — the job already lives in the database, so a
    /// lost publish is recoverable by the startup-recovery sweep.
    pub async fn publish(&self, stream: &str, event: &Event) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(stream, error = %e, "failed to serialize event for publish");
                return false;
            }
        };

        let mut conn = self.conn.clone();
        let result: Result<String, RedisError> = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
            .await;

        match result {
            Ok(entry_id) => {
                debug!(stream, entry_id, "published event");
                true
            }
            Err(e) => {
                warn!(stream, error = %e, "publish failed, substrate unreachable");
                false
            }
        }
    }

    /// Ensure `group` exists on `stream`, creating the stream if necessary.
    /// Idempotent: swallows Redis's "BUSYGROUP" error.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> EventBusResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn
            .xgroup_create_mkstream(stream, group, "0")
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `count` new entries for `consumer` in `group`, blocking
    /// for `block` if nothing is immediately available. Entries are decoded
    /// into [`Event`]s; an entry whose payload fails to decode is logged and
    /// skipped rather than returned (a poison entry should not wedge the
    /// whole read).
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> EventBusResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;
        Ok(decode_reply(reply))
    }

    /// Acknowledge a delivered entry, removing it from the group's pending
    /// entries list.
    pub async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> EventBusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }

    /// Claim entries that have been pending for at least `min_idle` without
    /// acknowledgement, reassigning them to `consumer`. The recovery
    /// mechanism for an owner that died or is stuck.
    pub async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> EventBusResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();

        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count as isize)
            .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.time_since_delivered >= min_idle.as_millis() as usize)
            .map(|p| p.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamReadReply = conn
            .xclaim(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                &stale_ids,
            )
            .await?;

        let deliveries = decode_reply(claimed);
        if !deliveries.is_empty() {
            info!(
                stream,
                group,
                count = deliveries.len(),
                "claimed stale pending entries"
            );
        }
        Ok(deliveries)
    }
}

fn decode_reply(reply: StreamReadReply) -> Vec<Delivery> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let Some(raw) = id.map.get(PAYLOAD_FIELD) else {
                warn!(entry_id = %id.id, "stream entry missing payload field, skipping");
                continue;
            };
            let raw_str = match raw {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                other => {
                    warn!(entry_id = %id.id, ?other, "unexpected payload value type, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<Event>(&raw_str) {
                Ok(event) => out.push(Delivery {
                    entry_id: id.id,
                    event,
                }),
                Err(e) => {
                    warn!(entry_id = %id.id, error = %e, "failed to decode event payload, skipping");
                }
            }
        }
    }
    out
}

/// Caps a reconnect backoff at 16s: 1 → 2 → 4 → 8 → 16.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let capped_exp = attempt.min(4);
    Duration::from_secs(1u64 << capped_exp)
}

/// Best-effort broadcast control channel (stop signals, batch aborts),
/// layered on raw pub/sub rather than a durable stream — kept separate
/// from the at-least-once delivery streams above.
#[derive(Clone)]
pub struct ControlChannel {
    conn: ConnectionManager,
}

impl ControlChannel {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn publish(&self, channel: &str, message: &str) -> EventBusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }
}

pub const STOP_CHANNEL: &str = "pipeline:stop";
pub const CANCEL_BATCH_PREFIX: &str = "pipeline:cancel_batch:";

/// Listens for the control broadcast channels over a dedicated pub/sub
/// connection. Built on a raw `redis::Client` rather than
/// `ConnectionManager` since streaming pub/sub messages needs a
/// connection that isn't shared for request/response calls.
pub struct ControlListener {
    client: redis::Client,
}

impl ControlListener {
    pub fn new(redis_url: &str) -> EventBusResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    /// Reconnects with the capped backoff from [`reconnect_backoff`] on
    /// subscription failure; spawns a background task that cancels
    /// `token` the moment a message arrives on [`STOP_CHANNEL`].
    pub fn watch_stop(&self, token: tokio_util::sync::CancellationToken) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(STOP_CHANNEL).await {
                            warn!(error = %e, "failed to subscribe to stop channel, retrying");
                            tokio::time::sleep(reconnect_backoff(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        attempt = 0;
                        let mut stream = pubsub.on_message();
                        use futures::StreamExt;
                        if stream.next().await.is_some() {
                            info!("received pipeline stop signal");
                            token.cancel();
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "control listener disconnected, reconnecting");
                        tokio::time::sleep(reconnect_backoff(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        });
    }

    /// Spawns a background task that records any batch id mentioned on a
    /// `pipeline:cancel_batch:{id}` publish into `cancelled`, which the
    /// daemon polls at suspension points.
    pub fn watch_batch_cancels(&self, cancelled: std::sync::Arc<tokio::sync::Mutex<std::collections::HashSet<String>>>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(format!("{CANCEL_BATCH_PREFIX}*")).await {
                            warn!(error = %e, "failed to psubscribe to batch cancel channel, retrying");
                            tokio::time::sleep(reconnect_backoff(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        attempt = 0;
                        let mut stream = pubsub.on_message();
                        use futures::StreamExt;
                        while let Some(msg) = stream.next().await {
                            let channel: String = msg.get_channel_name().to_string();
                            if let Some(batch_id) = channel.strip_prefix(CANCEL_BATCH_PREFIX) {
                                info!(batch_id, "received batch cancel signal");
                                cancelled.lock().await.insert(batch_id.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "batch cancel listener disconnected, reconnecting");
                        tokio::time::sleep(reconnect_backoff(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_caps_at_sixteen_seconds() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(16));
        assert_eq!(reconnect_backoff(9), Duration::from_secs(16));
    }
}
