//! The episode store: authoritative relational state for episodes,
//! transcripts, summaries, and the vector-chunk side table, all guarded by
//! deterministic-ID upserts rather than application-level locking.

pub mod chunks;
pub mod error;
pub mod recovery;

use chrono::{DateTime, Utc};
use podpipe_common::episode::{Episode, EpisodeMetadata, EpisodeStatus, Summary, SummaryContent};
use sqlx::{PgPool, Row};

pub use error::{StoreError, StoreResult};

/// Filter applied to [`EpisodeStore::list_episodes`].
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    pub status: Option<EpisodeStatus>,
    pub podcast_name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl EpisodeFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            podcast_name: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Clone)]
pub struct EpisodeStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct EpisodeRow {
    id: String,
    url: String,
    title: String,
    podcast_name: String,
    status: String,
    transcript_text: Option<String>,
    metadata: serde_json::Value,
    is_selected: bool,
    is_seen: bool,
    is_favorite: bool,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl EpisodeRow {
    fn into_episode(self) -> Result<Episode, StoreError> {
        let status = parse_status(&self.status)?;
        let metadata: EpisodeMetadata = serde_json::from_value(self.metadata)?;
        Ok(Episode {
            id: self.id,
            url: self.url,
            title: self.title,
            podcast_name: self.podcast_name,
            status,
            transcript_text: self.transcript_text,
            metadata,
            is_selected: self.is_selected,
            is_seen: self.is_seen,
            is_favorite: self.is_favorite,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}

fn parse_status(raw: &str) -> Result<EpisodeStatus, StoreError> {
    match raw {
        "PENDING" => Ok(EpisodeStatus::Pending),
        "PROCESSING" => Ok(EpisodeStatus::Processing),
        "TRANSCRIBING" => Ok(EpisodeStatus::Transcribing),
        "COMPLETED" => Ok(EpisodeStatus::Completed),
        "FAILED" => Ok(EpisodeStatus::Failed),
        other => Err(StoreError::UnknownStatus(other.to_string())),
    }
}

impl EpisodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations. Safe to call on every startup.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent insert: a row with this `id` racing in from a concurrent
    /// creator is a no-op, and the existing row is returned either way.
    pub async fn create_episode(
        &self,
        id: &str,
        url: &str,
        title: &str,
        podcast_name: &str,
        metadata: &EpisodeMetadata,
    ) -> StoreResult<Episode> {
        sqlx::query(
            r#"
            INSERT INTO episodes (id, url, title, podcast_name, status, metadata)
            VALUES ($1, $2, $3, $4, 'PENDING', $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(url)
        .bind(title)
        .bind(podcast_name)
        .bind(serde_json::to_value(metadata)?)
        .execute(&self.pool)
        .await?;

        self.get_episode_by_id(id, false)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn update_episode_status(&self, id: &str, status: EpisodeStatus) -> StoreResult<()> {
        sqlx::query("UPDATE episodes SET status = $1, status_changed_at = now() WHERE id = $2")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write the transcript body, merge `metadata` into the existing
    /// metadata object, set `processed_at`, and move status to a terminal
    /// value.
    pub async fn save_transcript(
        &self,
        episode_id: &str,
        transcript_text: &str,
        metadata: &EpisodeMetadata,
        terminal_status: EpisodeStatus,
    ) -> StoreResult<()> {
        if !terminal_status.is_terminal() {
            return Err(StoreError::NonTerminalStatus(terminal_status.to_string()));
        }

        sqlx::query(
            r#"
            UPDATE episodes
            SET transcript_text = $1,
                metadata = metadata || $2,
                status = $3,
                status_changed_at = now(),
                processed_at = now()
            WHERE id = $4
            "#,
        )
        .bind(transcript_text)
        .bind(serde_json::to_value(metadata)?)
        .bind(terminal_status.to_string())
        .bind(episode_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// `load_transcript = false` never materializes `transcript_text` —
    /// list endpoints depend on this to stay cheap.
    pub async fn get_episode_by_id(
        &self,
        id: &str,
        load_transcript: bool,
    ) -> StoreResult<Option<Episode>> {
        if load_transcript {
            let row = sqlx::query_as::<_, EpisodeRow>(
                r#"
                SELECT id, url, title, podcast_name, status, transcript_text,
                       metadata, is_selected, is_seen, is_favorite, created_at, processed_at
                FROM episodes WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(EpisodeRow::into_episode).transpose()
        } else {
            let row = sqlx::query_as::<_, EpisodeRow>(
                r#"
                SELECT id, url, title, podcast_name, status, NULL::text AS transcript_text,
                       metadata, is_selected, is_seen, is_favorite, created_at, processed_at
                FROM episodes WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(EpisodeRow::into_episode).transpose()
        }
    }

    pub async fn list_episodes(&self, filter: &EpisodeFilter) -> StoreResult<Vec<Episode>> {
        let status_str = filter.status.map(|s| s.to_string());
        let rows = sqlx::query_as::<_, EpisodeRow>(
            r#"
            SELECT id, url, title, podcast_name, status, NULL::text AS transcript_text,
                   metadata, is_selected, is_seen, is_favorite, created_at, processed_at
            FROM episodes
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR podcast_name = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status_str)
        .bind(&filter.podcast_name)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EpisodeRow::into_episode).collect()
    }

    /// Enforces the one-summary-per-episode invariant: if a row already
    /// exists, it is returned untouched rather than overwritten.
    pub async fn save_summary(&self, episode_id: &str, content: &SummaryContent) -> StoreResult<Summary> {
        content
            .validate()
            .map_err(|e| StoreError::InvalidSummary(e.to_string()))?;

        if let Some(existing) = self.get_summary_by_episode_id(episode_id).await? {
            return Ok(existing);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO summaries (episode_id, content)
            VALUES ($1, $2)
            ON CONFLICT (episode_id) DO NOTHING
            RETURNING id, episode_id, content, created_at
            "#,
        )
        .bind(episode_id)
        .bind(serde_json::to_value(content)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Summary {
                id: row.try_get("id")?,
                episode_id: row.try_get("episode_id")?,
                content: serde_json::from_value(row.try_get("content")?)?,
                created_at: row.try_get("created_at")?,
            }),
            // Lost the insert race to a concurrent writer; the invariant
            // still holds, just fetch what they wrote.
            None => self
                .get_summary_by_episode_id(episode_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(episode_id.to_string())),
        }
    }

    pub async fn get_summary_by_episode_id(&self, episode_id: &str) -> StoreResult<Option<Summary>> {
        let row = sqlx::query("SELECT id, episode_id, content, created_at FROM summaries WHERE episode_id = $1")
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Summary {
                id: row.try_get("id")?,
                episode_id: row.try_get("episode_id")?,
                content: serde_json::from_value(row.try_get("content")?)?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn mark_episodes_as_seen(&self, ids: &[String], seen: bool) -> StoreResult<()> {
        sqlx::query("UPDATE episodes SET is_seen = $1 WHERE id = ANY($2)")
            .bind(seen)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_transcript_rejects_non_terminal_status() {
        // Exercised indirectly via the guard clause without a live pool:
        // EpisodeStatus::Processing is not terminal.
        assert!(!EpisodeStatus::Processing.is_terminal());
        assert!(EpisodeStatus::Completed.is_terminal());
        assert!(EpisodeStatus::Failed.is_terminal());
    }

    fn test_url() -> Option<String> {
        std::env::var("DATABASE_TEST_URL").ok()
    }

    #[tokio::test]
    async fn create_episode_is_idempotent_under_conflict() {
        let Some(url) = test_url() else { return };
        let pool = PgPool::connect(&url).await.unwrap();
        let store = EpisodeStore::new(pool);
        store.migrate().await.unwrap();

        let metadata = EpisodeMetadata::default();
        let first = store
            .create_episode("ep-idempotent-1", "https://example.com/a.mp3", "Title", "Pod", &metadata)
            .await
            .unwrap();
        let second = store
            .create_episode("ep-idempotent-1", "https://example.com/a.mp3", "Different Title", "Pod", &metadata)
            .await
            .unwrap();

        assert_eq!(first.title, second.title);
        assert_eq!(second.title, "Title");
    }

    #[tokio::test]
    async fn save_summary_is_one_per_episode() {
        let Some(url) = test_url() else { return };
        let pool = PgPool::connect(&url).await.unwrap();
        let store = EpisodeStore::new(pool);
        store.migrate().await.unwrap();

        let metadata = EpisodeMetadata::default();
        store
            .create_episode("ep-summary-once", "https://example.com/b.mp3", "T", "P", &metadata)
            .await
            .unwrap();

        let content = sample_summary();
        let first = store.save_summary("ep-summary-once", &content).await.unwrap();

        let mut other = sample_summary();
        other.hook = "A different hook entirely".to_string();
        let second = store.save_summary("ep-summary-once", &other).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.content.hook, first.content.hook);
    }

    fn sample_summary() -> SummaryContent {
        use podpipe_common::episode::{Concept, KeyTakeaway};
        SummaryContent {
            hook: "A hook that draws you in".to_string(),
            key_takeaways: vec![
                KeyTakeaway { concept: "A".into(), explanation: "a".into() },
                KeyTakeaway { concept: "B".into(), explanation: "b".into() },
                KeyTakeaway { concept: "C".into(), explanation: "c".into() },
            ],
            actionable_advice: vec!["do a".into(), "do b".into(), "do c".into()],
            quotes: vec!["quote one".into(), "quote two".into()],
            concepts: vec![Concept { term: "x".into(), definition: "y".into() }],
            perspectives: "balanced".into(),
            narrative_summary: "x".repeat(210),
            key_topics: vec!["topic".into()],
        }
    }
}
