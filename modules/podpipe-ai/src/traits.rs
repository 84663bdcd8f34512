use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::types::{ChatMessage, Segment, SpeakerTurn};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request to model provider failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model provider returned an error ({status}): {body}")]
    Provider { status: u16, body: String },

    #[error("model response was empty")]
    EmptyResponse,

    #[error("structured output failed validation after {attempts} attempt(s): {last_error}")]
    ValidationExhausted { attempts: u32, last_error: String },

    #[error("failed to decode model response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type AiResult<T> = std::result::Result<T, AiError>;

/// Speech-to-text, specified only as a contract — model internals are
/// deliberately out of scope here. `audio_path` is already a local file;
/// fetching and extracting it from the source URL (including any
/// video-to-audio extraction) happens upstream of this trait.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> AiResult<Vec<Segment>>;
}

/// Speaker clustering over a sanitized mono WAV copy of the audio.
/// Diarization is allowed to fail independently of
/// transcription; callers fall back to [`SpeakerTurn`]s with a sentinel
/// speaker built directly from the raw [`Segment`]s.
#[async_trait]
pub trait Diarizer: Send + Sync {
    async fn diarize(&self, wav_path: &Path, segments: &[Segment]) -> AiResult<Vec<SpeakerTurn>>;
}

/// Sentinel speaker label used when diarization fails or is unavailable.
pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";

/// Build the diarization fallback: one turn per segment, all attributed
/// to [`UNKNOWN_SPEAKER`].
pub fn fallback_turns(segments: &[Segment]) -> Vec<SpeakerTurn> {
    segments
        .iter()
        .map(|s| SpeakerTurn {
            speaker: UNKNOWN_SPEAKER.to_string(),
            start_seconds: s.start_seconds,
            end_seconds: s.end_seconds,
            text: s.text.clone(),
        })
        .collect()
}

/// Narrative generation and validated structured extraction: stage 1
/// produces unstructured narrative, stage 2 extracts a validated
/// structured object with retry-on-validation-fail.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> AiResult<String>;

    /// Request JSON matching `schema` and decode it as `T`, retrying with
    /// a corrective follow-up message up to `max_retries` times when
    /// either decoding or `validate` rejects the result.
    async fn complete_structured<T>(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        max_retries: u32,
        validate: impl for<'a> Fn(&'a T) -> Result<(), String> + Send + Sync,
    ) -> AiResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut attempt = 0;
        let mut conversation = messages.to_vec();
        let mut last_error = String::new();

        loop {
            attempt += 1;
            let raw = self.complete_json(&conversation, schema).await?;

            let outcome = serde_json::from_str::<T>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|parsed| validate(&parsed).map(|_| parsed).map_err(|e| e));

            match outcome {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    last_error = e;
                    warn!(attempt, error = %last_error, "structured output failed validation");
                    if attempt > max_retries {
                        return Err(AiError::ValidationExhausted {
                            attempts: attempt,
                            last_error,
                        });
                    }
                    conversation.push(ChatMessage::assistant(raw));
                    conversation.push(ChatMessage::user(format!(
                        "That response was invalid: {last_error}. Reply again with corrected JSON matching the schema."
                    )));
                }
            }
        }
    }

    /// Request a raw JSON string matching `schema`, with no retry or
    /// validation — the building block [`ChatModel::complete_structured`]
    /// is layered on top of.
    async fn complete_json(&self, messages: &[ChatMessage], schema: &serde_json::Value) -> AiResult<String>;
}

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str) -> AiResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> AiResult<Vec<Vec<f32>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_turns_use_unknown_speaker() {
        let segments = vec![Segment {
            start_seconds: 0.0,
            end_seconds: 1.5,
            text: "hello".into(),
        }];
        let turns = fallback_turns(&segments);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, UNKNOWN_SPEAKER);
        assert_eq!(turns[0].text, "hello");
    }
}
