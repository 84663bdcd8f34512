//! The RAG ingestion subscriber: turns a transcribed episode into vector
//! chunks and a keyword-searchable document set.

pub mod chunking;
pub mod embedding;
pub mod error;
pub mod keyword;

use std::sync::Arc;

use podpipe_ai::EmbeddingModel;
use podpipe_common::event::Event;
use podpipe_common::transcript;
use podpipe_eventbus::{ControlListener, Delivery, EventBus};
use podpipe_gpulock::GpuLock;
use podpipe_idempotency::{ClaimOutcome, IdempotencyRegister};
use podpipe_status::StatusAggregator;
use podpipe_store::chunks::{ChunkStore, ChunkWrite};
use podpipe_store::EpisodeStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::chunking::{chunk_by_speaker_turns, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::error::{RagError, RagResult};
use crate::keyword::{IndexDocument, KeywordIndex};

pub const EPISODES_TRANSCRIBED_STREAM: &str = "episodes:transcribed";
pub const CONSUMER_GROUP: &str = "rag_subscribers";
pub const SERVICE_NAME: &str = "rag";
const EVENT_TYPE: &str = "transcribed";

pub struct Deps {
    pub bus: EventBus,
    pub idempotency: IdempotencyRegister,
    pub gpu_lock: GpuLock,
    pub status: StatusAggregator,
    pub store: EpisodeStore,
    pub chunks: ChunkStore,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub keyword_index: KeywordIndex,
}

pub struct RagSubscriber {
    deps: Deps,
    consumer_name: String,
}

impl RagSubscriber {
    pub fn new(deps: Deps, consumer_name: impl Into<String>) -> Self {
        Self {
            deps,
            consumer_name: consumer_name.into(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken, control: &ControlListener) -> anyhow::Result<()> {
        self.deps.bus.ensure_group(EPISODES_TRANSCRIBED_STREAM, CONSUMER_GROUP).await?;
        control.watch_stop(shutdown.clone());

        let mut reconnect_attempt = 0u32;

        'read_loop: loop {
            if shutdown.is_cancelled() {
                break;
            }

            let deliveries = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.deps.bus.read_group(
                    EPISODES_TRANSCRIBED_STREAM,
                    CONSUMER_GROUP,
                    &self.consumer_name,
                    1,
                    std::time::Duration::from_secs(5),
                ) => result,
            };

            let deliveries = match deliveries {
                Ok(deliveries) => {
                    reconnect_attempt = 0;
                    deliveries
                }
                Err(e) => {
                    let backoff = podpipe_eventbus::reconnect_backoff(reconnect_attempt);
                    warn!(error = %e, attempt = reconnect_attempt, backoff_secs = backoff.as_secs(), "failed to read episodes:transcribed, retrying");
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue 'read_loop;
                }
            };

            for delivery in deliveries {
                self.process_delivery(&delivery).await;
            }
        }

        Ok(())
    }

    async fn process_delivery(&self, delivery: &Delivery) {
        let Event::EpisodeTranscribed(event) = delivery.event.clone() else {
            warn!("non-transcribed event on episodes:transcribed, acking and skipping");
            self.ack(delivery).await;
            return;
        };

        let span = info_span!("rag_ingest", episode_id = %event.episode_id);
        let result = self.ingest_episode(&event.episode_id).instrument(span).await;

        match result {
            Ok(()) => self.ack(delivery).await,
            Err(e) => {
                warn!(episode_id = %event.episode_id, error = %e, "rag ingestion failed, leaving unacked for retry");
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        self.deps.bus.ack(EPISODES_TRANSCRIBED_STREAM, CONSUMER_GROUP, &delivery.entry_id).await.ok();
    }

    /// The per-event pipeline: idempotency claim, defense-in-depth
    /// existence check, load, chunk, embed under the GPU lock, upsert
    /// vectors, update the keyword index.
    async fn ingest_episode(&self, episode_id: &str) -> RagResult<()> {
        let key = IdempotencyRegister::make_key(SERVICE_NAME, EVENT_TYPE, episode_id);
        if self.deps.idempotency.claim_default(&key).await? == ClaimOutcome::Duplicate {
            info!(episode_id, "duplicate delivery, already claimed");
            return Ok(());
        }

        if self.deps.chunks.exists_for_episode(episode_id).await? {
            info!(episode_id, "chunks already exist, skipping (defense in depth)");
            return Ok(());
        }

        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "loading", 0.1, None, None)
            .await
            .ok();

        let episode = self
            .deps
            .store
            .get_episode_by_id(episode_id, true)
            .await?
            .ok_or_else(|| RagError::EpisodeNotFound(episode_id.to_string()))?;

        let transcript_text = episode
            .transcript_text
            .clone()
            .ok_or_else(|| RagError::MissingTranscript(episode_id.to_string()))?;

        let chunks = tokio::task::spawn_blocking(move || {
            let body = transcript::body_lines(&transcript_text);
            chunk_by_speaker_turns(&body, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
        })
        .await
        .map_err(|_| RagError::BlockingTaskPanicked)?;

        if chunks.is_empty() {
            info!(episode_id, "transcript produced no chunks, nothing to ingest");
            self.deps.status.clear_service_status(SERVICE_NAME, episode_id).await.ok();
            return Ok(());
        }

        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "embedding", 0.4, None, None)
            .await
            .ok();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedding::embed_all(&self.deps.gpu_lock, self.deps.embedder.as_ref(), &texts).await?;

        let mut documents = Vec::with_capacity(chunks.len());
        for (index, (chunk, embedding)) in chunks.iter().zip(embeddings.into_iter()).enumerate() {
            let id = self
                .deps
                .chunks
                .upsert(&ChunkWrite {
                    episode_id: episode_id.to_string(),
                    chunk_index: index,
                    speaker: chunk.speaker.clone(),
                    timestamp_str: chunk.timestamp.clone(),
                    text: chunk.text.clone(),
                    embedding,
                })
                .await?;
            documents.push(IndexDocument {
                id: id.to_string(),
                text: chunk.text.clone(),
            });
        }

        let keyword_index = self.deps.keyword_index.clone();
        tokio::task::spawn_blocking(move || keyword_index.append_documents(&documents))
            .await
            .map_err(|_| RagError::BlockingTaskPanicked)??;
        self.deps.status.clear_service_status(SERVICE_NAME, episode_id).await.ok();

        info!(episode_id, chunk_count = documents.len(), "episode ingested into RAG stores");
        Ok(())
    }
}
