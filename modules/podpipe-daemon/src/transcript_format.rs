//! The on-disk transcript text format: a small header block of
//! `Key: value` lines terminated by a `========` separator, followed by
//! one speaker turn per line. Written here by the daemon; parsed by the
//! RAG subscriber (`podpipe-rag`) using the exact same separator.

use podpipe_ai::SpeakerTurn;
use podpipe_common::episode::Episode;
use podpipe_common::transcript::HEADER_SEPARATOR;

fn format_hms(total_seconds: f64) -> String {
    let total = total_seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

pub fn format_transcript(episode: &Episode, turns: &[SpeakerTurn]) -> String {
    let mut out = String::new();

    out.push_str(&format!("Title: {}\n", episode.title));
    out.push_str(&format!("Episode: {}\n", episode.id));
    out.push_str(&format!("Podcast: {}\n", episode.podcast_name));
    out.push_str(&format!("Processed: {}\n", chrono::Utc::now().to_rfc3339()));
    if let Some(duration) = episode.metadata.duration_seconds {
        out.push_str(&format!("Duration: {duration}\n"));
    }
    if let Some(audio_url) = &episode.metadata.audio_url {
        out.push_str(&format!("Audio URL: {audio_url}\n"));
    }
    let speakers: std::collections::BTreeSet<&str> = turns.iter().map(|t| t.speaker.as_str()).collect();
    if !speakers.is_empty() {
        out.push_str(&format!("Speakers: {}\n", speakers.into_iter().collect::<Vec<_>>().join(", ")));
    }
    out.push_str(HEADER_SEPARATOR);
    out.push('\n');

    for turn in turns {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            turn.speaker,
            format_hms(turn.start_seconds),
            turn.text
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use podpipe_common::episode::{EpisodeMetadata, EpisodeStatus};

    fn sample_episode() -> Episode {
        Episode {
            id: "ep-1".into(),
            url: "https://example.com/ep1.mp3".into(),
            title: "Episode One".into(),
            podcast_name: "A Podcast".into(),
            status: EpisodeStatus::Transcribing,
            transcript_text: None,
            metadata: EpisodeMetadata {
                audio_url: Some("https://example.com/ep1.mp3".into()),
                duration_seconds: Some(125.0),
                ..Default::default()
            },
            is_selected: false,
            is_seen: false,
            is_favorite: false,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn header_ends_with_separator_before_body() {
        let turns = vec![SpeakerTurn {
            speaker: "SPEAKER_00".into(),
            start_seconds: 65.0,
            end_seconds: 70.0,
            text: "hello there".into(),
        }];
        let text = format_transcript(&sample_episode(), &turns);
        let sep_line = text.lines().find(|l| l.contains(HEADER_SEPARATOR)).unwrap();
        let sep_index = text.lines().position(|l| l == sep_line).unwrap();
        assert!(text.lines().take(sep_index).any(|l| l.starts_with("Title:")));
        assert!(text.lines().nth(sep_index + 1).unwrap().starts_with("[SPEAKER_00] 00:01:05:"));
    }

    #[test]
    fn timestamp_formats_as_hh_mm_ss() {
        assert_eq!(format_hms(3725.0), "01:02:05");
        assert_eq!(format_hms(0.0), "00:00:00");
    }
}
