//! Transcript model: ordered segments with optional speaker/timestamp, derived
//! speaker statistics, and document metadata. Immutable for the duration of a
//! job once parsed.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A segment of the transcript with speaker information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub segment_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub text: String,
}

/// Speaker statistics derived from segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub id: String,
    pub name: String,
    pub segments_count: u64,
    pub total_words: u64,
}

/// Metadata about the transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub word_count: u64,
    pub segment_count: u64,
    pub speaker_count: u64,
}

/// Processed transcript with structured segments and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub speakers: Vec<Speaker>,
    pub metadata: TranscriptMetadata,
    pub raw_text: String,
    pub has_speaker_names: bool,
}

static SPEAKER_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Name: text (also covers numbered speakers like "Speaker 1")
        Regex::new(r"^([A-Z][a-z]+(?:\s+(?:[A-Z][a-z]+|\d+))?)\s*:\s*(.+)$").expect("speaker re"),
        // [Name] text
        Regex::new(r"^\[([^\]]+)\]\s*(.+)$").expect("speaker re"),
        // - Name: text
        Regex::new(r"^-\s*([A-Z][a-z]+(?:\s+(?:[A-Z][a-z]+|\d+))?)\s*:\s*(.+)$")
            .expect("speaker re"),
    ]
});

static TITLE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?m)^Title:\s*(.+)$").expect("title re"),
        Regex::new(r"(?m)^Meeting:\s*(.+)$").expect("title re"),
        Regex::new(r"(?m)^Subject:\s*(.+)$").expect("title re"),
        Regex::new(r"(?m)^#\s+(.+)$").expect("title re"),
    ]
});

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^(?:Meeting )?Date:\s*(\S+)").expect("date re"));
static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^(?:Duration|Length):\s*(.+)$").expect("duration re"));

impl Transcript {
    /// Parse a raw transcript into structured segments.
    ///
    /// Speaker labels are detected when a meaningful share of the leading
    /// lines match `Name: text` style patterns; otherwise segments are split
    /// on blank lines without speakers.
    #[must_use]
    pub fn parse(raw: &str, filename: Option<&str>) -> Self {
        let mut metadata = extract_metadata(raw, filename);
        let lines: Vec<&str> = raw.trim().lines().collect();
        let has_speaker_names = detect_speakers(&lines);

        let (segments, speakers) = if has_speaker_names {
            parse_with_speakers(&lines)
        } else {
            (parse_without_speakers(&lines), Vec::new())
        };

        metadata.word_count = segments
            .iter()
            .map(|s| s.text.split_whitespace().count() as u64)
            .sum();
        metadata.segment_count = segments.len() as u64;
        metadata.speaker_count = speakers.len() as u64;

        Self {
            segments,
            speakers,
            metadata,
            raw_text: raw.to_string(),
            has_speaker_names,
        }
    }

    /// Formatted text for analysis, preserving speaker labels where present.
    #[must_use]
    pub fn text_for_analysis(&self) -> String {
        if self.segments.is_empty() {
            return self.raw_text.clone();
        }
        let lines: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match &segment.speaker {
                Some(speaker) => format!("{speaker}: {}", segment.text),
                None => segment.text.clone(),
            })
            .collect();
        lines.join("\n\n")
    }

    /// Segment-id addressed view (`SEG <id> [ts] <speaker>: text`) used by
    /// the LLM insight extraction pass so evidence can cite segment ids.
    #[must_use]
    pub fn segmented_view(&self) -> String {
        let lines: Vec<String> = self
            .segments
            .iter()
            .map(|segment| {
                let mut prefix = format!("SEG {}", segment.segment_id);
                if let Some(ts) = &segment.timestamp {
                    prefix.push_str(&format!(" [{ts}]"));
                }
                let speaker = segment.speaker.as_deref().unwrap_or("Unknown");
                format!("{prefix} {speaker}: {}", segment.text)
            })
            .collect();
        lines.join("\n\n")
    }
}

fn extract_metadata(text: &str, filename: Option<&str>) -> TranscriptMetadata {
    let mut metadata = TranscriptMetadata {
        filename: filename.map(ToString::to_string),
        ..TranscriptMetadata::default()
    };

    for re in TITLE_RES.iter() {
        if let Some(caps) = re.captures(text) {
            metadata.title = Some(caps[1].trim().to_string());
            break;
        }
    }

    if let Some(caps) = DATE_RE.captures(text) {
        let raw = caps[1].trim();
        metadata.date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
            .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
            .ok();
    }

    if let Some(caps) = DURATION_RE.captures(text) {
        metadata.duration = Some(caps[1].trim().to_string());
    }

    metadata
}

fn match_speaker_line(line: &str) -> Option<(String, String)> {
    for re in SPEAKER_RES.iter() {
        if let Some(caps) = re.captures(line) {
            return Some((caps[1].trim().to_string(), caps[2].trim().to_string()));
        }
    }
    None
}

fn detect_speakers(lines: &[&str]) -> bool {
    let mut matched = 0usize;
    let mut total = 0usize;
    for line in lines.iter().take(50) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        if match_speaker_line(line).is_some() {
            matched += 1;
        }
    }
    total > 0 && (matched as f64 / total as f64) > 0.3
}

struct SpeakerStats {
    order: Vec<String>,
    segments: std::collections::HashMap<String, (u64, u64)>,
}

impl SpeakerStats {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            segments: std::collections::HashMap::new(),
        }
    }

    fn record(&mut self, name: &str, words: u64) {
        let entry = self.segments.entry(name.to_string()).or_insert_with(|| {
            self.order.push(name.to_string());
            (0, 0)
        });
        entry.0 += 1;
        entry.1 += words;
    }

    fn into_speakers(self) -> Vec<Speaker> {
        self.order
            .into_iter()
            .map(|name| {
                let (segments_count, total_words) = self.segments[&name];
                Speaker {
                    id: name.to_lowercase().replace(' ', "_"),
                    name,
                    segments_count,
                    total_words,
                }
            })
            .collect()
    }
}

fn parse_with_speakers(lines: &[&str]) -> (Vec<TranscriptSegment>, Vec<Speaker>) {
    let mut segments = Vec::new();
    let mut stats = SpeakerStats::new();
    let mut current_speaker: Option<String> = None;
    let mut current_text: Vec<String> = Vec::new();

    let mut flush =
        |speaker: &Option<String>, text: &mut Vec<String>, segments: &mut Vec<TranscriptSegment>, stats: &mut SpeakerStats| {
            if text.is_empty() {
                return;
            }
            let Some(name) = speaker else {
                text.clear();
                return;
            };
            let joined = text.join(" ");
            let words = joined.split_whitespace().count() as u64;
            segments.push(TranscriptSegment {
                segment_id: segments.len() as u64,
                speaker: Some(name.clone()),
                timestamp: None,
                text: joined,
            });
            stats.record(name, words);
            text.clear();
        };

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            // Blank line closes the current segment.
            flush(&current_speaker, &mut current_text, &mut segments, &mut stats);
            continue;
        }

        if let Some((speaker, text)) = match_speaker_line(line) {
            flush(&current_speaker, &mut current_text, &mut segments, &mut stats);
            current_speaker = Some(speaker);
            current_text.push(text);
        } else {
            current_text.push(line.to_string());
        }
    }
    flush(&current_speaker, &mut current_text, &mut segments, &mut stats);

    (segments, stats.into_speakers())
}

fn parse_without_speakers(lines: &[&str]) -> Vec<TranscriptSegment> {
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                segments.push(TranscriptSegment {
                    segment_id: segments.len() as u64,
                    speaker: None,
                    timestamp: None,
                    text: current.join(" "),
                });
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        segments.push(TranscriptSegment {
            segment_id: segments.len() as u64,
            speaker: None,
            timestamp: None,
            text: current.join(" "),
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_speaker_labelled_transcript() {
        let raw = "Alice: We should ship the new pricing page.\n\nBob: Agreed, let's do it.\n\nAlice: I'll own the rollout.";
        let transcript = Transcript::parse(raw, None);

        assert!(transcript.has_speaker_names);
        assert_eq!(transcript.segments.len(), 3);
        assert_eq!(transcript.segments[0].segment_id, 0);
        assert_eq!(transcript.segments[2].segment_id, 2);
        assert_eq!(transcript.segments[0].speaker.as_deref(), Some("Alice"));
        assert_eq!(transcript.speakers.len(), 2);
        let alice = &transcript.speakers[0];
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.segments_count, 2);
    }

    #[test]
    fn parses_numbered_speakers() {
        let raw = "Speaker 1: Ship the fix by Friday.\n\nSpeaker 2: Agreed.";
        let transcript = Transcript::parse(raw, None);

        assert!(transcript.has_speaker_names);
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[0].speaker.as_deref(), Some("Speaker 1"));
        assert_eq!(transcript.segments[1].speaker.as_deref(), Some("Speaker 2"));
    }

    #[test]
    fn falls_back_to_blank_line_segments() {
        let raw = "first paragraph of notes\ncontinues here\n\nsecond paragraph";
        let transcript = Transcript::parse(raw, None);

        assert!(!transcript.has_speaker_names);
        assert_eq!(transcript.segments.len(), 2);
        assert!(transcript.segments[0].speaker.is_none());
        assert_eq!(
            transcript.segments[0].text,
            "first paragraph of notes continues here"
        );
    }

    #[test]
    fn extracts_title_and_date_metadata() {
        let raw = "Title: Q3 Planning\nDate: 2025-01-15\nDuration: 45m\n\nAlice: Let's start.\n\nBob: Sure.";
        let transcript = Transcript::parse(raw, Some("q3.txt"));

        assert_eq!(transcript.metadata.title.as_deref(), Some("Q3 Planning"));
        assert_eq!(
            transcript.metadata.date,
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
        assert_eq!(transcript.metadata.duration.as_deref(), Some("45m"));
        assert_eq!(transcript.metadata.filename.as_deref(), Some("q3.txt"));
    }

    #[test]
    fn text_for_analysis_preserves_speaker_labels() {
        let raw = "Alice: Hello there.\n\nBob: Hi.";
        let transcript = Transcript::parse(raw, None);
        let text = transcript.text_for_analysis();
        assert_eq!(text, "Alice: Hello there.\n\nBob: Hi.");
    }

    #[test]
    fn segmented_view_addresses_segments_by_id() {
        let raw = "Alice: Hello there.\n\nBob: Hi.";
        let transcript = Transcript::parse(raw, None);
        let view = transcript.segmented_view();
        assert!(view.starts_with("SEG 0 Alice: Hello there."));
        assert!(view.contains("SEG 1 Bob: Hi."));
    }

    #[test]
    fn segment_ids_are_dense_and_unique() {
        let raw = "Alice: a.\n\nBob: b.\n\nAlice: c.\n\nBob: d.";
        let transcript = Transcript::parse(raw, None);
        let ids: Vec<u64> = transcript.segments.iter().map(|s| s.segment_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
