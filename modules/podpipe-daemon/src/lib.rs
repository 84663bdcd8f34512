//! The transcription worker daemon: the lifecycle that binds every
//! other coordination crate together.

pub mod batch;
pub mod download;
pub mod transcript_format;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use podpipe_ai::{Diarizer, Transcriber};
use podpipe_common::episode::EpisodeStatus;
use podpipe_common::event::{BatchTranscribed, EpisodeTranscribed, Event, TranscriptionJob};
use podpipe_common::security::UrlValidator;
use podpipe_eventbus::{ControlListener, Delivery, EventBus};
use podpipe_gpulock::{GpuLock, GpuLockGuard};
use podpipe_status::StatusAggregator;
use podpipe_store::EpisodeStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::batch::BatchTracker;

pub const TRANSCRIPTION_JOBS_STREAM: &str = "transcription_jobs";
pub const EPISODES_TRANSCRIBED_STREAM: &str = "episodes:transcribed";
pub const BATCH_TRANSCRIBED_STREAM: &str = "batch:transcribed";
pub const CONSUMER_GROUP: &str = "transcription_workers";
pub const SERVICE_NAME: &str = "transcription";

/// Everything a job needs to run, grouped the way every binary in this
/// workspace threads its dependencies through one struct rather than as
/// loose parameters.
pub struct Deps {
    pub bus: EventBus,
    pub gpu_lock: GpuLock,
    pub status: StatusAggregator,
    pub store: EpisodeStore,
    pub transcriber: Arc<dyn Transcriber>,
    pub diarizer: Arc<dyn Diarizer>,
    pub http: reqwest::Client,
    pub url_validator: UrlValidator,
    pub temp_audio_dir: String,
}

pub struct Daemon {
    deps: Deps,
    consumer_name: String,
    batches: BatchTracker,
    held_lock: Option<GpuLockGuard>,
    cancelled_batches: Arc<Mutex<HashSet<String>>>,
}

impl Daemon {
    pub fn new(deps: Deps, consumer_name: impl Into<String>) -> Self {
        Self {
            deps,
            consumer_name: consumer_name.into(),
            batches: BatchTracker::new(),
            held_lock: None,
            cancelled_batches: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Startup recovery: revert rows stuck mid-pipeline
    /// and clear stale status keys so a crashed daemon doesn't leave the
    /// aggregator lying about what's in flight.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let threshold = Utc::now() - ChronoDuration::minutes(30);
        let reverted = podpipe_store::recovery::revert_stuck_episodes(self.deps.store.pool(), threshold).await?;
        for episode_id in &reverted {
            self.deps.status.clear_service_status(SERVICE_NAME, episode_id).await.ok();
        }
        tokio::fs::remove_dir_all(&self.deps.temp_audio_dir).await.ok();
        Ok(())
    }

    /// Run until `shutdown` is cancelled. On a stop signal, abort any job
    /// in flight.
    pub async fn run(&mut self, shutdown: CancellationToken, control: &ControlListener) -> anyhow::Result<()> {
        self.deps.bus.ensure_group(TRANSCRIPTION_JOBS_STREAM, CONSUMER_GROUP).await?;
        control.watch_stop(shutdown.clone());
        control.watch_batch_cancels(self.cancelled_batches.clone());

        let mut reconnect_attempt = 0u32;

        'read_loop: loop {
            if shutdown.is_cancelled() {
                break;
            }

            let deliveries = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.deps.bus.read_group(
                    TRANSCRIPTION_JOBS_STREAM,
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
                    warn!(error = %e, attempt = reconnect_attempt, backoff_secs = backoff.as_secs(), "failed to read transcription_jobs, retrying");
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue 'read_loop;
                }
            };

            for delivery in deliveries {
                let Event::TranscriptionJob(job) = delivery.event.clone() else {
                    warn!("non-job event on transcription_jobs stream, acking and skipping");
                    self.deps.bus.ack(TRANSCRIPTION_JOBS_STREAM, CONSUMER_GROUP, &delivery.entry_id).await.ok();
                    continue;
                };

                let span = info_span!(
                    "process_job",
                    episode_id = %job.episode_id,
                    batch_id = job.batch_id.as_deref().unwrap_or("none"),
                    stage = tracing::field::Empty,
                );
                self.process_delivery(&delivery, job, &shutdown).instrument(span).await;
            }
        }

        self.shutdown_in_flight().await;
        Ok(())
    }

    async fn process_delivery(&mut self, delivery: &Delivery, job: TranscriptionJob, shutdown: &CancellationToken) {
        match self.process_job(&job, shutdown).await {
            Ok(()) => {
                self.deps
                    .bus
                    .ack(TRANSCRIPTION_JOBS_STREAM, CONSUMER_GROUP, &delivery.entry_id)
                    .await
                    .ok();
            }
            Err(e) => {
                error!(error = %e, episode_id = %job.episode_id, "job failed, leaving unacked for retry");
            }
        }
    }

    async fn is_cancelled(&self, shutdown: &CancellationToken, batch_id: Option<&str>) -> bool {
        if shutdown.is_cancelled() {
            return true;
        }
        if let Some(batch_id) = batch_id {
            return self.cancelled_batches.lock().await.contains(batch_id);
        }
        false
    }

    /// Per-job state machine.
    async fn process_job(&mut self, job: &TranscriptionJob, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let episode_id = &job.episode_id;

        tracing::Span::current().record("stage", "preparing");
        self.deps.store.update_episode_status(episode_id, EpisodeStatus::Transcribing).await?;
        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "preparing", 0.0, Some("preparing"), None)
            .await
            .ok();

        let episode = match self.deps.store.get_episode_by_id(episode_id, false).await? {
            Some(e) => e,
            None => {
                warn!(episode_id, "episode not found, skipping job");
                return Ok(());
            }
        };

        if self.is_cancelled(shutdown, job.batch_id.as_deref()).await {
            return self.fail_job(episode_id, job.batch_id.as_deref()).await;
        }

        if self.held_lock.is_none() {
            self.held_lock = Some(self.deps.gpu_lock.acquire().await?);
        }

        if self.is_cancelled(shutdown, job.batch_id.as_deref()).await {
            return self.fail_job(episode_id, job.batch_id.as_deref()).await;
        }

        let Some(audio_url) = episode.metadata.audio_url.clone() else {
            warn!(episode_id, "no audio_url on episode, marking FAILED");
            return self.fail_job(episode_id, job.batch_id.as_deref()).await;
        };

        tracing::Span::current().record("stage", "downloading");
        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "downloading", 0.1, Some("downloading audio"), None)
            .await
            .ok();

        let audio_path = match download::download_audio(
            &self.deps.http,
            &self.deps.url_validator,
            &audio_url,
            &self.deps.temp_audio_dir,
        )
        .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!(episode_id, error = %e, "audio download rejected or failed");
                return self.fail_job(episode_id, job.batch_id.as_deref()).await;
            }
        };

        let result = self.transcribe_and_persist(&episode_id.clone(), &episode, &audio_path).await;
        tokio::fs::remove_file(&audio_path).await.ok();

        match result {
            Ok(diarization_failed) => {
                self.publish_transcribed(&episode, diarization_failed).await?;
                self.maybe_complete_batch(job).await?;
                Ok(())
            }
            Err(e) => {
                warn!(episode_id, error = %e, "transcription failed");
                self.fail_job(episode_id, job.batch_id.as_deref()).await
            }
        }
    }

    async fn transcribe_and_persist(
        &self,
        episode_id: &str,
        episode: &podpipe_common::episode::Episode,
        audio_path: &Path,
    ) -> anyhow::Result<bool> {
        tracing::Span::current().record("stage", "transcribing");
        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "transcribing", 0.4, Some("transcribing audio"), None)
            .await
            .ok();

        let segments = self.deps.transcriber.transcribe(audio_path).await?;

        tracing::Span::current().record("stage", "diarizing");
        self.deps
            .status
            .update_service_status(SERVICE_NAME, episode_id, "diarizing", 0.7, Some("diarizing speakers"), None)
            .await
            .ok();

        let (turns, diarization_failed) = match self.deps.diarizer.diarize(audio_path, &segments).await {
            Ok(turns) => (turns, false),
            Err(e) => {
                warn!(episode_id, error = %e, "diarization failed, falling back to raw segments");
                (podpipe_ai::fallback_turns(&segments), true)
            }
        };

        let transcript_text = transcript_format::format_transcript(episode, &turns);

        let mut metadata = episode.metadata.clone();
        metadata.diarization_failed = Some(diarization_failed);
        metadata.processed_date = Some(Utc::now().to_rfc3339());

        self.deps
            .store
            .save_transcript(episode_id, &transcript_text, &metadata, EpisodeStatus::Completed)
            .await?;

        Ok(diarization_failed)
    }

    async fn publish_transcribed(&self, episode: &podpipe_common::episode::Episode, diarization_failed: bool) -> anyhow::Result<()> {
        let event = Event::EpisodeTranscribed(EpisodeTranscribed {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            service: SERVICE_NAME.to_string(),
            episode_id: episode.id.clone(),
            episode_title: episode.title.clone(),
            podcast_name: episode.podcast_name.clone(),
            audio_url: episode.metadata.audio_url.clone(),
            duration_seconds: episode.metadata.duration_seconds,
            diarization_failed,
        });

        if !self.deps.bus.publish(EPISODES_TRANSCRIBED_STREAM, &event).await {
            warn!(episode_id = %episode.id, "failed to publish EpisodeTranscribed, transcript is durable in the store");
        }

        self.deps.status.clear_service_status(SERVICE_NAME, &episode.id).await.ok();
        info!(episode_id = %episode.id, "episode transcribed");
        Ok(())
    }

    async fn fail_job(&mut self, episode_id: &str, batch_id: Option<&str>) -> anyhow::Result<()> {
        self.deps.store.update_episode_status(episode_id, EpisodeStatus::Failed).await?;
        self.deps.status.clear_service_status(SERVICE_NAME, episode_id).await.ok();
        if let Some(batch_id) = batch_id {
            self.cancelled_batches.lock().await.remove(batch_id);
        }
        if let Some(guard) = self.held_lock.take() {
            guard.release().await.ok();
        }
        Ok(())
    }

    /// Batch completion handoff: release the GPU the
    /// instant the batch is drained, even with other jobs queued.
    async fn maybe_complete_batch(&mut self, job: &TranscriptionJob) -> anyhow::Result<()> {
        let (Some(batch_id), Some(total)) = (&job.batch_id, job.total_batch_count) else {
            return Ok(());
        };

        if let Some(episode_ids) = self.batches.record_completion(batch_id, &job.episode_id, total) {
            let event = Event::BatchTranscribed(BatchTranscribed {
                event_id: uuid::Uuid::new_v4().to_string(),
                service: SERVICE_NAME.to_string(),
                batch_id: batch_id.clone(),
                episode_ids,
            });
            self.deps.bus.publish(BATCH_TRANSCRIBED_STREAM, &event).await;

            if let Some(guard) = self.held_lock.take() {
                guard.release().await.ok();
            }
        }

        Ok(())
    }

    async fn shutdown_in_flight(&mut self) {
        if let Some(guard) = self.held_lock.take() {
            guard.release().await.ok();
        }
        info!("daemon shutting down, GPU released");
    }
}
