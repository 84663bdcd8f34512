//! The summarization subscriber: stage 1 produces an unstructured
//! narrative, stage 2 extracts a validated structured summary from it.

pub mod error;

use podpipe_ai::{ChatMessage, ChatModel};
use podpipe_common::episode::SummaryContent;
use podpipe_common::event::{Event, EpisodeSummarized};
use podpipe_eventbus::{ControlListener, Delivery, EventBus};
use podpipe_gpulock::GpuLock;
use podpipe_idempotency::{ClaimOutcome, IdempotencyRegister};
use podpipe_status::StatusAggregator;
use podpipe_store::EpisodeStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{SummarizeError, SummarizeResult};

pub const EPISODES_TRANSCRIBED_STREAM: &str = "episodes:transcribed";
pub const EPISODES_SUMMARIZED_STREAM: &str = "episodes:summarized";
pub const CONSUMER_GROUP: &str = "summarization_subscribers";
pub const SERVICE_NAME: &str = "summarization";
const EVENT_TYPE: &str = "transcribed";
const STAGE2_MAX_RETRIES: u32 = 3;
const TRANSCRIPT_CHAR_LIMIT: usize = 50_000;

pub struct Deps<C: ChatModel> {
    pub bus: EventBus,
    pub idempotency: IdempotencyRegister,
    pub gpu_lock: GpuLock,
    pub status: StatusAggregator,
    pub store: EpisodeStore,
    pub chat: C,
}

pub struct SummarizeSubscriber<C: ChatModel> {
    deps: Deps<C>,
    consumer_name: String,
}

impl<C: ChatModel> SummarizeSubscriber<C> {
    pub fn new(deps: Deps<C>, consumer_name: impl Into<String>) -> Self {
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

        let span = info_span!("summarize_episode", episode_id = %event.episode_id);
        let result = self
            .summarize_episode(&event.episode_id, &event.episode_title, &event.podcast_name)
            .instrument(span)
            .await;

        match result {
            Ok(()) => self.ack(delivery).await,
            Err(e) => {
                warn!(episode_id = %event.episode_id, error = %e, "summarization failed, leaving unacked for retry");
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        self.deps.bus.ack(EPISODES_TRANSCRIBED_STREAM, CONSUMER_GROUP, &delivery.entry_id).await.ok();
    }

    async fn summarize_episode(&self, episode_id: &str, episode_title: &str, podcast_name: &str) -> SummarizeResult<()> {
        let key = IdempotencyRegister::make_key(SERVICE_NAME, EVENT_TYPE, episode_id);
        if self.deps.idempotency.claim_default(&key).await? == ClaimOutcome::Duplicate {
            info!(episode_id, "duplicate delivery, already claimed");
            return Ok(());
        }

        if self.deps.store.get_summary_by_episode_id(episode_id).await?.is_some() {
            info!(episode_id, "summary already exists, skipping (defense in depth)");
            return Ok(());
        }

        let episode = self
            .deps
            .store
            .get_episode_by_id(episode_id, true)
            .await?
            .ok_or_else(|| SummarizeError::EpisodeNotFound(episode_id.to_string()))?;

        let transcript_text = episode
            .transcript_text
            .as_deref()
            .ok_or_else(|| SummarizeError::MissingTranscript(episode_id.to_string()))?;

        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "summarizing", 0.2, None, None)
            .await
            .ok();

        let guard = self.deps.gpu_lock.acquire().await?;

        let narrative_result = self.generate_narrative(transcript_text, episode_title, podcast_name).await;
        let narrative = match narrative_result {
            Ok(n) => n,
            Err(e) => {
                guard.release().await.ok();
                return Err(e.into());
            }
        };

        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "structuring", 0.6, None, None)
            .await
            .ok();

        let structured_result = self.extract_structure(&narrative, episode_title, podcast_name).await;
        guard.release().await.ok();
        let content = structured_result?;

        let summary = self.deps.store.save_summary(episode_id, &content).await?;

        let summarized = EpisodeSummarized {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            service: SERVICE_NAME.to_string(),
            episode_id: episode_id.to_string(),
            episode_title: episode_title.to_string(),
            podcast_name: podcast_name.to_string(),
            summary_path: summary_virtual_path(summary.id),
            summary_data: serde_json::to_value(&summary.content)?,
        };
        self.deps.bus.publish(EPISODES_SUMMARIZED_STREAM, &Event::EpisodeSummarized(summarized)).await;

        self.deps.status.clear_service_status(SERVICE_NAME, episode_id).await.ok();
        info!(episode_id, "episode summarized");
        Ok(())
    }

    /// Stage 1: an unconstrained narrative pass over the transcript.
    async fn generate_narrative(&self, transcript_text: &str, episode_title: &str, podcast_name: &str) -> podpipe_ai::AiResult<String> {
        let truncated = truncate_transcript(transcript_text);
        let messages = vec![
            ChatMessage::system(
                "You are an expert podcast analyst. Read the transcript and write a thorough, \
                 free-form narrative summary covering the hook, key points, quotes, and \
                 practical advice discussed. Do not format as JSON.",
            ),
            ChatMessage::user(format!(
                "Podcast: {podcast_name}\nEpisode: {episode_title}\n\nTranscript:\n{truncated}"
            )),
        ];
        self.deps.chat.complete(&messages).await
    }

    /// Stage 2: extract the validated structured object from the stage 1
    /// narrative, retrying with the validation error fed back on failure.
    async fn extract_structure(&self, narrative: &str, episode_title: &str, podcast_name: &str) -> podpipe_ai::AiResult<SummaryContent> {
        let schema = serde_json::to_value(schemars::schema_for!(SummaryContent))?;
        let messages = vec![
            ChatMessage::system(
                "Extract a structured summary from the narrative below, matching the schema \
                 exactly: a punchy hook, 3-5 key takeaways, at least 3 actionable advice items, \
                 2-5 memorable quotes, notable concepts, a perspectives paragraph, a narrative \
                 summary of at least 200 characters, and key topics.",
            ),
            ChatMessage::user(format!("Podcast: {podcast_name}\nEpisode: {episode_title}\n\nNarrative:\n{narrative}")),
        ];

        self.deps
            .chat
            .complete_structured(&messages, &schema, STAGE2_MAX_RETRIES, |c: &SummaryContent| {
                c.validate().map_err(|e| e.to_string())
            })
            .await
    }
}

/// Cap the transcript fed to stage 1 so one oversized episode doesn't blow
/// past the provider's context window.
fn truncate_transcript(transcript_text: &str) -> String {
    transcript_text.chars().take(TRANSCRIPT_CHAR_LIMIT).collect()
}

/// The opaque virtual reference published on `EpisodeSummarized` — the
/// store is authoritative, so events only ever carry a pointer into it.
fn summary_virtual_path(summary_id: i64) -> String {
    format!("db://summaries/{summary_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_transcript_respects_the_character_limit() {
        let long = "x".repeat(TRANSCRIPT_CHAR_LIMIT + 500);
        let truncated = truncate_transcript(&long);
        assert_eq!(truncated.chars().count(), TRANSCRIPT_CHAR_LIMIT);
    }

    #[test]
    fn truncate_transcript_is_a_no_op_under_the_limit() {
        let short = "hello world";
        assert_eq!(truncate_transcript(short), short);
    }

    #[test]
    fn summary_virtual_path_is_a_db_reference() {
        assert_eq!(summary_virtual_path(42), "db://summaries/42");
    }
}
