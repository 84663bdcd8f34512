//! Typed event payloads carried on the event bus.
//!
//! Rather than passing untyped dict payloads straight into handlers, this
//! workspace decodes once at the bus boundary into this tagged enum and
//! never passes a raw JSON map downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job enqueued on the `transcription_jobs` stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptionJob {
    pub episode_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_batch_count: Option<u32>,
}

/// Published on `episodes:transcribed` once the daemon has persisted a
/// transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeTranscribed {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub episode_id: String,
    pub episode_title: String,
    pub podcast_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub diarization_failed: bool,
}

/// Published on `episodes:summarized` once the summarization subscriber
/// has persisted a structured summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeSummarized {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub episode_id: String,
    pub episode_title: String,
    pub podcast_name: String,
    /// Opaque virtual reference, e.g. `db://summaries/{id}`.
    pub summary_path: String,
    pub summary_data: Value,
}

/// Published on `batch:transcribed` when the daemon's batch-completion
/// handoff fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchTranscribed {
    pub event_id: String,
    pub service: String,
    pub batch_id: String,
    pub episode_ids: Vec<String>,
}

/// Tagged sum type for every event shape the bus carries. Streams are
/// homogeneous in practice (one variant per stream), but decoding into this
/// enum at the bus boundary means no handler ever sees a raw JSON map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum Event {
    TranscriptionJob(TranscriptionJob),
    EpisodeTranscribed(EpisodeTranscribed),
    EpisodeSummarized(EpisodeSummarized),
    BatchTranscribed(BatchTranscribed),
}

impl Event {
    pub fn episode_id(&self) -> Option<&str> {
        match self {
            Event::TranscriptionJob(e) => Some(&e.episode_id),
            Event::EpisodeTranscribed(e) => Some(&e.episode_id),
            Event::EpisodeSummarized(e) => Some(&e.episode_id),
            Event::BatchTranscribed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let ev = Event::EpisodeTranscribed(EpisodeTranscribed {
            event_id: "e1".into(),
            timestamp: Utc::now(),
            service: "transcription-daemon".into(),
            episode_id: "ep-A".into(),
            episode_title: "Title".into(),
            podcast_name: "Pod".into(),
            audio_url: Some("https://cdn/a.mp3".into()),
            duration_seconds: Some(120.0),
            diarization_failed: false,
        });

        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
        assert_eq!(back.episode_id(), Some("ep-A"));
    }

    #[test]
    fn batch_transcribed_has_no_single_episode_id() {
        let ev = Event::BatchTranscribed(BatchTranscribed {
            event_id: "b1".into(),
            service: "transcription-daemon".into(),
            batch_id: "batch-1".into(),
            episode_ids: vec!["ep-A".into(), "ep-B".into()],
        });
        assert_eq!(ev.episode_id(), None);
    }
}
