//! The single connection pool to the coordination substrate.
//!
//! Every other coordination crate (idempotency, event bus, GPU lock, status
//! aggregator) is built on top of one shared [`SubstrateClient`]: a cheaply
//! cloned handle around `redis`'s auto-reconnecting [`ConnectionManager`].
//! Nothing in this crate knows about episodes, transcripts, or GPUs — it
//! only knows about streams, consumer groups, key-value with TTL, sets,
//! scripts, and pub/sub.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("substrate unreachable: {0}")]
    Unreachable(String),
}

pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

/// A cheap-to-clone handle to the Redis coordination substrate.
///
/// `ConnectionManager` already reconnects transparently and queues
/// commands across brief outages, so cloning this struct just clones an
/// `Arc`-backed handle — callers do not need their own pool.
#[derive(Clone)]
pub struct SubstrateClient {
    manager: ConnectionManager,
}

impl SubstrateClient {
    /// Connect to the substrate. Fails fast if the initial connection
    /// cannot be established; subsequent transient disconnects are handled
    /// by `ConnectionManager`'s internal reconnect loop.
    pub async fn connect(redis_url: &str) -> SubstrateResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    /// A clone of the underlying connection manager, for crates that need
    /// to issue raw commands this wrapper doesn't expose (e.g. `XADD` with
    /// stream-specific options, or `Script::invoke_async`).
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Atomic "set if absent, with expiration". The building block for
    /// both the idempotency register and the GPU lock.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> SubstrateResult<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    pub async fn get(&self, key: &str) -> SubstrateResult<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> SubstrateResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> SubstrateResult<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    pub async fn del(&self, key: &str) -> SubstrateResult<bool> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> SubstrateResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> SubstrateResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(key).await?)
    }

    /// Publish to a non-durable pub/sub broadcast channel.
    /// Best-effort: logs and returns the redis error to the caller rather
    /// than panicking, matching the fails-soft policy of the event bus
    /// layered on top.
    pub async fn publish_raw(&self, channel: &str, payload: &str) -> SubstrateResult<()> {
        let mut conn = self.manager.clone();
        match conn.publish::<_, _, i64>(channel, payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(channel, error = %e, "publish_raw failed");
                Err(e.into())
            }
        }
    }
}
