//! The idempotency register.
//!
//! A handler's first act after parsing an event is to [`IdempotencyRegister::claim`]
//! the key for that (service, event type, episode) triple; on
//! [`ClaimOutcome::Duplicate`] it acks and does no work. The claim and the
//! side effect it protects are not transactional with each other — the
//! deterministic-ID upsert at the storage layer is the second line of
//! defense.

use podpipe_substrate::{SubstrateClient, SubstrateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

pub type IdempotencyResult<T> = std::result::Result<T, IdempotencyError>;

/// Default TTL for an idempotency claim: 24 hours.
pub const DEFAULT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller is the first to observe the key; proceed with the work.
    FirstTimer,
    /// The key was already claimed; skip the work.
    Duplicate,
}

#[derive(Clone)]
pub struct IdempotencyRegister {
    substrate: SubstrateClient,
}

impl IdempotencyRegister {
    pub fn new(substrate: SubstrateClient) -> Self {
        Self { substrate }
    }

    /// `idempotency:{service}:{event_type}:{episode_id}`.
    pub fn make_key(service: &str, event_type: &str, episode_id: &str) -> String {
        format!("idempotency:{service}:{event_type}:{episode_id}")
    }

    /// Atomically claim `key` with `ttl_secs`. Returns `FirstTimer` iff the
    /// set happened (i.e. the key was absent).
    pub async fn claim(&self, key: &str, ttl_secs: u64) -> IdempotencyResult<ClaimOutcome> {
        let set = self.substrate.set_nx_ex(key, "1", ttl_secs).await?;
        Ok(if set {
            ClaimOutcome::FirstTimer
        } else {
            ClaimOutcome::Duplicate
        })
    }

    /// Claim using the default 24h TTL.
    pub async fn claim_default(&self, key: &str) -> IdempotencyResult<ClaimOutcome> {
        self.claim(key, DEFAULT_TTL_SECS).await
    }

    pub async fn is_processed(&self, key: &str) -> IdempotencyResult<bool> {
        Ok(self.substrate.exists(key).await?)
    }

    /// Non-atomic; for test fixtures only.
    pub async fn mark_processed(&self, key: &str, ttl_secs: u64) -> IdempotencyResult<()> {
        self.substrate.set_ex(key, "1", ttl_secs).await?;
        Ok(())
    }

    /// Administrative: clear a key so it can be reprocessed.
    pub async fn clear(&self, key: &str) -> IdempotencyResult<bool> {
        Ok(self.substrate.del(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> Option<String> {
        std::env::var("REDIS_TEST_URL").ok()
    }

    #[tokio::test]
    async fn claim_is_commutative_exactly_one_first_timer() {
        let Some(url) = test_url() else { return };
        let substrate = SubstrateClient::connect(&url).await.unwrap();
        let register = IdempotencyRegister::new(substrate);

        let key = IdempotencyRegister::make_key("rag", "transcribed", "ep-claim-test");
        register.clear(&key).await.unwrap();

        let first = register.claim_default(&key).await.unwrap();
        let second = register.claim_default(&key).await.unwrap();

        assert_eq!(first, ClaimOutcome::FirstTimer);
        assert_eq!(second, ClaimOutcome::Duplicate);

        register.clear(&key).await.unwrap();
    }

    #[test]
    fn make_key_has_stable_namespaced_shape() {
        assert_eq!(
            IdempotencyRegister::make_key("rag", "transcribed", "ep_123"),
            "idempotency:rag:transcribed:ep_123"
        );
    }
}
