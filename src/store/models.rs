use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a transcript's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Audio,
    Video,
    Text,
    Markdown,
    Daemon,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Audio => "audio",
            SourceKind::Video => "video",
            SourceKind::Text => "text",
            SourceKind::Markdown => "markdown",
            SourceKind::Daemon => "daemon",
        }
    }
}

/// One transcript document (`transcripts/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub decimal: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub diarized: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub speakers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Analysis results keyed by analysis-type name.
    #[serde(default)]
    pub analysis: BTreeMap<String, AnalysisResult>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    #[serde(default)]
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// A JSON string for text analyses, an object/array for JSON analyses.
    pub output: serde_json::Value,
    pub model: String,
    pub analyzed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
}

impl AnalysisResult {
    /// Render the output as prompt/display text.
    pub fn as_text(&self) -> String {
        match &self.output {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}

impl Transcript {
    /// A fresh transcript with timestamps set and an id derived from date + title.
    pub fn new(title: &str, date: &str, source_kind: SourceKind) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let date = if date.is_empty() { now.clone() } else { date.to_string() };
        Self {
            id: make_id(&date, title),
            title: title.to_string(),
            decimal: None,
            source_path: None,
            source_kind,
            date,
            duration_seconds: 0.0,
            model: None,
            diarized: false,
            language: None,
            speakers: Vec::new(),
            tags: Vec::new(),
            segments: Vec::new(),
            text: String::new(),
            metadata: None,
            analysis: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Collect distinct speaker names from segments, keeping first-seen order.
    pub fn collect_speakers(&mut self) {
        let mut seen = std::collections::HashSet::new();
        for seg in &self.segments {
            if !seg.speaker.is_empty() && seen.insert(seg.speaker.clone()) {
                self.speakers.push(seg.speaker.clone());
            }
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Transcript id: `YYYYMMDD-title-slug`. Slugs never contain `--`, which
/// keeps the `<transcript>--<analysis>` action key unambiguous.
pub fn make_id(date: &str, title: &str) -> String {
    let digits: String = date.chars().filter(|c| c.is_ascii_digit()).take(8).collect();
    let slug = slugify(title);
    match (digits.len() == 8, slug.is_empty()) {
        (true, false) => format!("{digits}-{slug}"),
        (true, true) => digits,
        (false, false) => slug,
        (false, true) => uuid::Uuid::new_v4().simple().to_string(),
    }
}

pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    for ch in s.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    trimmed.chars().take(60).collect::<String>().trim_end_matches('-').to_string()
}
