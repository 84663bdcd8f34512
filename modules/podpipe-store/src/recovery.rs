//! Startup recovery for rows abandoned mid-pipeline by a crashed daemon.
//! Reusable so both the daemon binary and its tests can drive the same
//! revert logic.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::error::StoreResult;

/// Revert episodes that have sat in `PROCESSING` or `TRANSCRIBING` since
/// before `older_than`, measured from the last status transition (not
/// row creation, so a job claimed seconds ago on a long-lived row isn't
/// reverted out from under the daemon that's actively working it) back
/// to `PENDING`, so the next daemon pass re-claims them. Returns the
/// reverted episode ids.
pub async fn revert_stuck_episodes(pool: &PgPool, older_than: DateTime<Utc>) -> StoreResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE episodes
        SET status = 'PENDING',
            status_changed_at = now()
        WHERE status IN ('PROCESSING', 'TRANSCRIBING')
          AND status_changed_at < $1
        RETURNING id
        "#,
    )
    .bind(older_than)
    .fetch_all(pool)
    .await?;

    if !ids.is_empty() {
        info!(count = ids.len(), "reverted stuck episodes to PENDING on startup recovery");
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EpisodeStore;
    use chrono::Duration;
    use podpipe_common::episode::{EpisodeMetadata, EpisodeStatus};

    fn test_url() -> Option<String> {
        std::env::var("DATABASE_TEST_URL").ok()
    }

    #[tokio::test]
    async fn reverts_only_stale_non_terminal_rows() {
        let Some(url) = test_url() else { return };
        let pool = PgPool::connect(&url).await.unwrap();
        let store = EpisodeStore::new(pool.clone());
        store.migrate().await.unwrap();

        let metadata = EpisodeMetadata::default();
        store
            .create_episode("ep-stuck", "https://example.com/stuck.mp3", "T", "P", &metadata)
            .await
            .unwrap();
        store
            .update_episode_status("ep-stuck", EpisodeStatus::Transcribing)
            .await
            .unwrap();

        let reverted = revert_stuck_episodes(&pool, Utc::now() + Duration::seconds(1)).await.unwrap();
        assert!(reverted.contains(&"ep-stuck".to_string()));

        let episode = store.get_episode_by_id("ep-stuck", false).await.unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Pending);
    }
}
