use anyhow::{Context, Result};
use serde::Deserialize;

use crate::store::models::Segment;

/// Whisper-family JSON output (`whisper`, `whisperx`, `mlx_whisper`).
#[derive(Debug, Deserialize)]
pub struct WhisperOutput {
    pub text: Option<String>,
    pub language: Option<String>,
    pub segments: Option<Vec<WhisperSegment>>,
}

#[derive(Debug, Deserialize)]
pub struct WhisperSegment {
    pub text: Option<String>,
    pub start: Option<f64>,
    pub end: Option<f64>,
    // Also accept start_time/end_time
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Present when diarization ran.
    pub speaker: Option<String>,
}

/// Parsed recognizer output.
#[derive(Debug, Clone, Default)]
pub struct RecognizedText {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

impl RecognizedText {
    pub fn duration_seconds(&self) -> f64 {
        self.segments.iter().map(|s| s.end).fold(0.0, f64::max)
    }

    pub fn is_diarized(&self) -> bool {
        self.segments.iter().any(|s| !s.speaker.is_empty())
    }
}

/// Parse recognizer JSON. Missing top-level `text` is rebuilt from segments.
pub fn parse_whisper_json(content: &str) -> Result<RecognizedText> {
    let out: WhisperOutput =
        serde_json::from_str(content).context("Failed to parse transcription JSON")?;

    let segments: Vec<Segment> = out
        .segments
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| {
            let text = s.text?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(Segment {
                speaker: s.speaker.unwrap_or_default(),
                text,
                start: s.start.or(s.start_time).unwrap_or(0.0),
                end: s.end.or(s.end_time).unwrap_or(0.0),
            })
        })
        .collect();

    let text = match out.text.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => t,
        _ => join_segments(&segments),
    };

    Ok(RecognizedText {
        text,
        language: out.language,
        segments,
    })
}

/// Join segments into readable text, starting a new `Speaker:` paragraph
/// whenever the speaker changes.
pub fn join_segments(segments: &[Segment]) -> String {
    let mut out = String::new();
    let mut last_speaker = "";
    for seg in segments {
        if !seg.speaker.is_empty() && seg.speaker != last_speaker {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&seg.speaker);
            out.push_str(": ");
            last_speaker = seg.speaker.as_str();
        } else if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&seg.text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_whisper_output() {
        let json = r#"{"text": " Hello world. ", "language": "en",
            "segments": [{"start": 0.0, "end": 1.5, "text": " Hello"}, {"start": 1.5, "end": 3.0, "text": " world."}]}"#;
        let r = parse_whisper_json(json).unwrap();
        assert_eq!(r.text, "Hello world.");
        assert_eq!(r.language.as_deref(), Some("en"));
        assert_eq!(r.segments.len(), 2);
        assert_eq!(r.duration_seconds(), 3.0);
        assert!(!r.is_diarized());
    }

    #[test]
    fn diarized_output_without_text_is_joined_by_speaker() {
        let json = r#"{"segments": [
            {"start_time": 0, "end_time": 1, "text": "Hi.", "speaker": "SPEAKER_00"},
            {"start_time": 1, "end_time": 2, "text": "How are you?", "speaker": "SPEAKER_00"},
            {"start_time": 2, "end_time": 3, "text": "Fine.", "speaker": "SPEAKER_01"},
            {"start_time": 3, "end_time": 4, "text": "  "}
        ]}"#;
        let r = parse_whisper_json(json).unwrap();
        assert!(r.is_diarized());
        assert_eq!(r.segments.len(), 3);
        assert_eq!(r.text, "SPEAKER_00: Hi. How are you?\n\nSPEAKER_01: Fine.");
    }
}
