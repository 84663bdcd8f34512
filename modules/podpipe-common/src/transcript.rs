//! The on-disk transcript text format shared by the writer (the
//! transcription daemon) and every reader (the RAG and summarization
//! subscribers): a header block of `Key: value` lines terminated by a
//! `========` separator, followed by one speaker turn per line formatted
//! as `[<SPEAKER>] HH:MM:SS: <text>`.

use std::collections::HashMap;

pub const HEADER_SEPARATOR: &str = "========";

/// Sentinel used for a body line that doesn't match the expected shape.
pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";
pub const UNKNOWN_TIMESTAMP: &str = "00:00:00";

/// One parsed body line. Malformed lines still produce a chunk — they just
/// carry the sentinel speaker/timestamp rather than being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: String,
    pub timestamp: String,
    pub text: String,
}

/// Parse the `Key: value` lines preceding [`HEADER_SEPARATOR`]. Lines that
/// don't contain `: ` are skipped rather than failing the whole parse.
pub fn parse_header(transcript_text: &str) -> HashMap<String, String> {
    let mut header = HashMap::new();
    for line in transcript_text.lines() {
        if line.contains(HEADER_SEPARATOR) {
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            header.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    header
}

/// Everything after the header separator, with blank lines dropped.
pub fn body_lines(transcript_text: &str) -> Vec<&str> {
    let mut lines = transcript_text.lines();
    for line in lines.by_ref() {
        if line.contains(HEADER_SEPARATOR) {
            break;
        }
    }
    lines.filter(|l| !l.trim().is_empty()).collect()
}

/// Parse one body line as `[<speaker>] HH:MM:SS: <text>`. A line that
/// doesn't match falls back to the sentinel speaker/timestamp with the
/// trimmed line as its text, so a transcript with stray formatting noise
/// still produces something chunkable rather than losing content.
pub fn parse_line(line: &str) -> TranscriptLine {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix('[') {
        if let Some((speaker, rest)) = rest.split_once(']') {
            let rest = rest.trim_start();
            if let Some((timestamp, text)) = rest.split_once(": ") {
                if timestamp.len() == 8 && timestamp.chars().filter(|c| *c == ':').count() == 2 {
                    return TranscriptLine {
                        speaker: speaker.trim().to_string(),
                        timestamp: timestamp.trim().to_string(),
                        text: text.trim().to_string(),
                    };
                }
            }
        }
    }

    TranscriptLine {
        speaker: UNKNOWN_SPEAKER.to_string(),
        timestamp: UNKNOWN_TIMESTAMP.to_string(),
        text: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header_stops_at_separator() {
        let text = "Title: Ep\nPodcast: Show\n========\n[A] 00:00:01: hi\n";
        let header = parse_header(text);
        assert_eq!(header.get("Title").unwrap(), "Ep");
        assert_eq!(header.get("Podcast").unwrap(), "Show");
        assert_eq!(header.len(), 2);
    }

    #[test]
    fn body_lines_skips_header_and_blanks() {
        let text = "Title: Ep\n========\n[A] 00:00:01: hi\n\n[B] 00:00:02: there\n";
        assert_eq!(body_lines(text), vec!["[A] 00:00:01: hi", "[B] 00:00:02: there"]);
    }

    #[test]
    fn parse_line_extracts_speaker_timestamp_text() {
        let parsed = parse_line("[SPEAKER_00] 00:01:05: hello there");
        assert_eq!(parsed.speaker, "SPEAKER_00");
        assert_eq!(parsed.timestamp, "00:01:05");
        assert_eq!(parsed.text, "hello there");
    }

    #[test]
    fn parse_line_falls_back_to_sentinel_on_malformed_input() {
        let parsed = parse_line("not a transcript line at all");
        assert_eq!(parsed.speaker, UNKNOWN_SPEAKER);
        assert_eq!(parsed.timestamp, UNKNOWN_TIMESTAMP);
        assert_eq!(parsed.text, "not a transcript line at all");
    }
}
