//! Episode and Summary domain records.
//!
//! These mirror the `episodes` / `summaries` tables owned by
//! `podpipe-store`, but live here (dependency-free of sqlx) so every
//! service — including the event bus payload types in [`crate::event`] —
//! can share one definition.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::DomainError;

/// Episode processing status. Transitions are driven by the transcription
/// daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EpisodeStatus {
    Pending,
    Processing,
    Transcribing,
    Completed,
    Failed,
}

impl EpisodeStatus {
    /// Terminal statuses are the only ones for which `processed_at` is set.
    pub fn is_terminal(self) -> bool {
        matches!(self, EpisodeStatus::Completed | EpisodeStatus::Failed)
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EpisodeStatus::Pending => "PENDING",
            EpisodeStatus::Processing => "PROCESSING",
            EpisodeStatus::Transcribing => "TRANSCRIBING",
            EpisodeStatus::Completed => "COMPLETED",
            EpisodeStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Structured side-data carried in `episodes.metadata` (JSONB).
///
/// Known keys get typed accessors; anything else the daemon or a
/// subscriber stashes here round-trips through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub audio_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub speakers: Option<Vec<String>>,
    pub diarization_failed: Option<bool>,
    pub processed_date: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Authoritative record of one feed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub url: String,
    pub title: String,
    pub podcast_name: String,
    pub status: EpisodeStatus,
    pub transcript_text: Option<String>,
    pub metadata: EpisodeMetadata,
    pub is_selected: bool,
    pub is_seen: bool,
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A key takeaway: a bolded concept plus a short explanation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyTakeaway {
    pub concept: String,
    pub explanation: String,
}

/// A term or mental model with its definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Concept {
    pub term: String,
    pub definition: String,
}

/// The structured summary artifact. Construction is validated — there is
/// no way to build a `SummaryContent` that violates the cardinality
/// constraints below.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SummaryContent {
    pub hook: String,
    pub key_takeaways: Vec<KeyTakeaway>,
    pub actionable_advice: Vec<String>,
    pub quotes: Vec<String>,
    pub concepts: Vec<Concept>,
    pub perspectives: String,
    pub narrative_summary: String,
    pub key_topics: Vec<String>,
}

impl SummaryContent {
    /// Validate the cardinality and non-emptiness constraints: non-empty
    /// hook, 3–5 takeaways, ≥3 advice items, 2–5 quotes, narrative
    /// ≥200 chars.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.hook.trim().is_empty() {
            return Err(DomainError::InvalidSummary("hook must not be empty".into()));
        }
        if !(3..=5).contains(&self.key_takeaways.len()) {
            return Err(DomainError::InvalidSummary(format!(
                "key_takeaways must have 3-5 entries, got {}",
                self.key_takeaways.len()
            )));
        }
        if self.actionable_advice.len() < 3 {
            return Err(DomainError::InvalidSummary(format!(
                "actionable_advice must have >=3 entries, got {}",
                self.actionable_advice.len()
            )));
        }
        if !(2..=5).contains(&self.quotes.len()) {
            return Err(DomainError::InvalidSummary(format!(
                "quotes must have 2-5 entries, got {}",
                self.quotes.len()
            )));
        }
        if self.narrative_summary.chars().count() < 200 {
            return Err(DomainError::InvalidSummary(
                "narrative_summary must be >=200 characters".into(),
            ));
        }
        Ok(())
    }
}

/// One-to-many off [`Episode`]; at most one row per episode, enforced by
/// [`crate::error::DomainError`] callers and a unique index at the
/// storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub episode_id: String,
    pub content: SummaryContent,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_content() -> SummaryContent {
        SummaryContent {
            hook: "A punchy hook.".into(),
            key_takeaways: vec![
                KeyTakeaway { concept: "A".into(), explanation: "a".into() },
                KeyTakeaway { concept: "B".into(), explanation: "b".into() },
                KeyTakeaway { concept: "C".into(), explanation: "c".into() },
            ],
            actionable_advice: vec!["do x".into(), "do y".into(), "do z".into()],
            quotes: vec!["quote one".into(), "quote two".into()],
            concepts: vec![],
            perspectives: "They agreed.".into(),
            narrative_summary: "x".repeat(200),
            key_topics: vec!["topic".into()],
        }
    }

    #[test]
    fn accepts_well_formed_summary() {
        assert!(valid_content().validate().is_ok());
    }

    #[test]
    fn rejects_empty_hook() {
        let mut c = valid_content();
        c.hook = "  ".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_too_few_takeaways() {
        let mut c = valid_content();
        c.key_takeaways.truncate(2);
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_too_many_takeaways() {
        let mut c = valid_content();
        for i in 0..3 {
            c.key_takeaways.push(KeyTakeaway {
                concept: format!("extra-{i}"),
                explanation: "e".into(),
            });
        }
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_short_narrative() {
        let mut c = valid_content();
        c.narrative_summary = "too short".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_too_few_quotes() {
        let mut c = valid_content();
        c.quotes = vec!["only one".into()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_too_few_advice_items() {
        let mut c = valid_content();
        c.actionable_advice = vec!["only one".into()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(EpisodeStatus::Completed.is_terminal());
        assert!(EpisodeStatus::Failed.is_terminal());
        assert!(!EpisodeStatus::Pending.is_terminal());
        assert!(!EpisodeStatus::Transcribing.is_terminal());
    }
}
