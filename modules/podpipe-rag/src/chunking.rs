//! Chunk a transcript body by speaker turn, combining consecutive lines
//! from the same speaker until a character budget is reached, then
//! splitting the overflow with overlap so no context is lost at the seam.

use podpipe_common::transcript::{parse_line, UNKNOWN_SPEAKER, UNKNOWN_TIMESTAMP};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub speaker: String,
    pub timestamp: String,
    pub text: String,
}

pub fn chunk_by_speaker_turns(lines: &[&str], max_chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut current_speaker: Option<String> = None;
    let mut current_timestamp = UNKNOWN_TIMESTAMP.to_string();
    let mut current_text = String::new();

    for line in lines {
        let parsed = parse_line(line);
        if parsed.text.is_empty() {
            continue;
        }

        let speaker_changed = current_speaker.as_deref().is_some_and(|s| s != parsed.speaker);
        if speaker_changed {
            if !current_text.is_empty() {
                chunks.push(TextChunk {
                    speaker: current_speaker.take().unwrap(),
                    timestamp: std::mem::take(&mut current_timestamp),
                    text: std::mem::take(&mut current_text),
                });
            }
            current_speaker = Some(parsed.speaker);
            current_timestamp = parsed.timestamp;
            current_text = parsed.text;
            continue;
        }

        if current_speaker.is_none() {
            current_speaker = Some(parsed.speaker);
            current_timestamp = parsed.timestamp;
        }

        let combined = if current_text.is_empty() {
            parsed.text
        } else {
            format!("{current_text} {}", parsed.text)
        };

        let chars: Vec<char> = combined.chars().collect();
        if chars.len() > max_chunk_size {
            let mut start = 0;
            loop {
                let end = (start + max_chunk_size).min(chars.len());
                let piece: String = chars[start..end].iter().collect();
                if end < chars.len() {
                    chunks.push(TextChunk {
                        speaker: current_speaker.clone().unwrap(),
                        timestamp: current_timestamp.clone(),
                        text: piece,
                    });
                    start += max_chunk_size - overlap;
                } else {
                    current_text = piece;
                    break;
                }
            }
        } else {
            current_text = combined;
        }
    }

    if !current_text.is_empty() {
        chunks.push(TextChunk {
            speaker: current_speaker.unwrap_or_else(|| UNKNOWN_SPEAKER.to_string()),
            timestamp: current_timestamp,
            text: current_text,
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_same_speaker_lines_merge_into_one_chunk() {
        let lines = vec!["[A] 00:00:01: hello", "[A] 00:00:03: world"];
        let chunks = chunk_by_speaker_turns(&lines, 500, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].speaker, "A");
    }

    #[test]
    fn speaker_change_starts_a_new_chunk() {
        let lines = vec!["[A] 00:00:01: hello", "[B] 00:00:05: hi there"];
        let chunks = chunk_by_speaker_turns(&lines, 500, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].speaker, "A");
        assert_eq!(chunks[1].speaker, "B");
    }

    #[test]
    fn oversized_turn_splits_with_overlap() {
        let long_text = "x".repeat(12);
        let line = format!("[A] 00:00:01: {long_text}");
        let chunks = chunk_by_speaker_turns(&[line.as_str()], 5, 2);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 5));
    }

    #[test]
    fn malformed_line_falls_back_to_sentinel_single_line_chunk() {
        let chunks = chunk_by_speaker_turns(&["just some noise"], 500, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].speaker, UNKNOWN_SPEAKER);
        assert_eq!(chunks[0].text, "just some noise");
    }
}
