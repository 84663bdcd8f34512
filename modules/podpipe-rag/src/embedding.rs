//! Batched embedding calls serialized behind the GPU lock, with retry on
//! transient provider errors.

use std::time::Duration;

use podpipe_ai::EmbeddingModel;
use podpipe_gpulock::GpuLock;
use tracing::warn;

use crate::error::RagResult;

pub const EMBED_BATCH_SIZE: usize = 16;
const MAX_ATTEMPTS: u32 = 3;

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(4))
}

/// Embed `texts` in batches of [`EMBED_BATCH_SIZE`], holding the GPU lock
/// for the duration of each batch's call rather than the whole run so
/// other queued GPU work isn't starved by a large transcript.
pub async fn embed_all(gpu_lock: &GpuLock, model: &dyn EmbeddingModel, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
    let mut embeddings = Vec::with_capacity(texts.len());

    for batch in texts.chunks(EMBED_BATCH_SIZE) {
        let guard = gpu_lock.acquire().await?;

        let mut attempt = 0;
        let batch_embeddings = loop {
            match model.embed_batch(batch).await {
                Ok(result) => break result,
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, error = %e, "embedding batch failed, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(e) => {
                    guard.release().await.ok();
                    return Err(e.into());
                }
            }
        };

        guard.release().await.ok();
        embeddings.extend(batch_embeddings);
    }

    Ok(embeddings)
}
