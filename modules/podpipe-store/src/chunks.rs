//! Vector chunk side table: external to the episode's own row, keyed by a
//! deterministic `uuid5` so re-ingesting an episode overwrites its chunk
//! set rather than duplicating it.

use pgvector::Vector;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;

/// Namespace UUID chunk ids are derived under: `uuid5(CHUNKS_NAMESPACE,
/// "{episode_id}_{chunk_index}")`. Fixed so the same (episode, index)
/// pair always yields the same id across restarts.
pub const CHUNKS_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1b, 0x3a, 0x90, 0x4c, 0x52, 0x4d, 0x7e, 0x9a, 0x21, 0x8e, 0x3f, 0x5c, 0x0b, 0x71, 0xd4,
]);

pub fn chunk_id(episode_id: &str, chunk_index: usize) -> Uuid {
    Uuid::new_v5(&CHUNKS_NAMESPACE, format!("{episode_id}_{chunk_index}").as_bytes())
}

#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub episode_id: String,
    pub chunk_index: usize,
    pub speaker: String,
    pub timestamp_str: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct ChunkStore {
    pool: PgPool,
}

impl ChunkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert one chunk by its deterministic id. Overwrites on conflict,
    /// satisfying invariant 4 (at most one vector-chunk set per episode).
    pub async fn upsert(&self, chunk: &ChunkWrite) -> StoreResult<Uuid> {
        let id = chunk_id(&chunk.episode_id, chunk.chunk_index);

        sqlx::query(
            r#"
            INSERT INTO embedding_chunks (id, episode_id, chunk_index, speaker, timestamp_str, text, embedding)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                speaker = EXCLUDED.speaker,
                timestamp_str = EXCLUDED.timestamp_str,
                text = EXCLUDED.text,
                embedding = EXCLUDED.embedding
            "#,
        )
        .bind(id)
        .bind(&chunk.episode_id)
        .bind(chunk.chunk_index as i32)
        .bind(&chunk.speaker)
        .bind(&chunk.timestamp_str)
        .bind(&chunk.text)
        .bind(Vector::from(chunk.embedding.clone()))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Defense-in-depth existence check used by the RAG subscriber before
    /// doing any embedding work.
    pub async fn exists_for_episode(&self, episode_id: &str) -> StoreResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM embedding_chunks WHERE episode_id = $1 LIMIT 1")
                .bind(episode_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn nearest(&self, query: &[f32], limit: i64) -> StoreResult<Vec<(Uuid, String, f32)>> {
        let rows: Vec<(Uuid, String, f32)> = sqlx::query_as(
            r#"
            SELECT id, text, (embedding <-> $1) AS distance
            FROM embedding_chunks
            ORDER BY embedding <-> $1
            LIMIT $2
            "#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_deterministic_and_index_sensitive() {
        let a = chunk_id("ep-1", 0);
        let b = chunk_id("ep-1", 0);
        let c = chunk_id("ep-1", 1);
        let d = chunk_id("ep-2", 0);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
