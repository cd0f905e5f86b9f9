use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::store::models::{Segment, SourceKind, Transcript};

/// Parse a markdown transcript with optional YAML frontmatter.
///
/// Expected format:
/// ```text
/// ---
/// title: Interview with Ada
/// date: 2026-01-15
/// decimal: 50.01.01
/// tags: [ai, hiring]
/// ---
///
/// ## Ada (00:30)
/// Some text here.
///
/// ## Bob (01:15)
/// Response text.
/// ```
pub fn parse_markdown(content: &str, filename: &str) -> Result<Transcript> {
    let (frontmatter, body) = split_frontmatter(content);

    let mut title = filename_to_title(filename);
    let mut date = String::new();
    let mut decimal: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut speakers: Vec<String> = Vec::new();
    let mut metadata: Option<serde_json::Value> = None;

    if let Some(fm) = frontmatter {
        if let Ok(yaml) = serde_yaml::from_str::<serde_json::Value>(&fm) {
            if let Some(obj) = yaml.as_object() {
                if let Some(v) = obj.get("title").and_then(|v| v.as_str()) {
                    title = v.to_string();
                }
                if let Some(v) = obj.get("date").and_then(|v| v.as_str()) {
                    date = v.to_string();
                }
                // `decimal: 50.10` parses as the float 50.1; take the written text.
                decimal = match obj.get("decimal") {
                    Some(serde_json::Value::String(s)) => Some(s.trim().to_string()),
                    Some(serde_json::Value::Number(_)) => raw_scalar(&fm, "decimal"),
                    _ => None,
                };
                if let Some(arr) = obj.get("tags").and_then(|v| v.as_array()) {
                    tags = string_list(arr);
                }
                if let Some(arr) = obj.get("speakers").and_then(|v| v.as_array()) {
                    speakers = string_list(arr);
                }

                // Store remaining frontmatter fields as metadata
                let mut extra = serde_json::Map::new();
                for (k, v) in obj {
                    if !["title", "date", "decimal", "tags", "speakers"].contains(&k.as_str()) {
                        extra.insert(k.clone(), v.clone());
                    }
                }
                if !extra.is_empty() {
                    metadata = Some(serde_json::Value::Object(extra));
                }
            }
        }
    }

    let segments = parse_speaker_segments(body);

    let mut t = Transcript::new(&title, &date, SourceKind::Markdown);
    t.decimal = decimal;
    t.tags = tags;
    t.metadata = metadata;
    t.text = body.trim().to_string();
    t.segments = segments;
    t.speakers = speakers;
    if t.speakers.is_empty() {
        t.collect_speakers();
    }
    Ok(t)
}

fn string_list(arr: &[serde_json::Value]) -> Vec<String> {
    arr.iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

/// Split `---\n...\n---` YAML front matter from the body.
pub fn split_frontmatter(content: &str) -> (Option<String>, &str) {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return (None, content);
    }

    // Find the closing ---
    let after_first = &trimmed[3..];
    if let Some(end) = after_first.find("\n---") {
        let fm = after_first[..end].trim().to_string();
        let body_start = 3 + end + 4; // skip past closing ---
        let body = if body_start < trimmed.len() {
            &trimmed[body_start..]
        } else {
            ""
        };
        (Some(fm), body)
    } else {
        (None, content)
    }
}

pub fn filename_to_title(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    stem.replace(['-', '_'], " ")
}

/// The unparsed text of a top-level `key: value` line in front matter.
fn raw_scalar(frontmatter: &str, key: &str) -> Option<String> {
    frontmatter.lines().find_map(|line| {
        let value = line.strip_prefix(key)?.strip_prefix(':')?;
        let value = value.split(" #").next().unwrap_or(value).trim();
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Match: ## Speaker Name (MM:SS) or ## Speaker Name (HH:MM:SS)
    RE.get_or_init(|| {
        Regex::new(r"(?m)^##\s+(.+?)\s*(?:\((\d{1,2}:\d{2}(?::\d{2})?)\))?\s*$")
            .expect("valid heading regex")
    })
}

/// Parse `## Speaker (MM:SS)` headings into segments.
fn parse_speaker_segments(body: &str) -> Vec<Segment> {
    let mut headings: Vec<(usize, usize, String, f64)> = Vec::new();
    for cap in heading_re().captures_iter(body) {
        let Some(full) = cap.get(0) else { continue };
        let speaker = cap[1].trim().to_string();
        let timestamp = cap.get(2).map(|m| parse_timestamp(m.as_str())).unwrap_or(0.0);
        headings.push((full.start(), full.end(), speaker, timestamp));
    }

    let mut segments = Vec::new();
    for (i, (_start, end, speaker, timestamp)) in headings.iter().enumerate() {
        let text_end = headings.get(i + 1).map_or(body.len(), |next| next.0);
        let text = body[*end..text_end].trim().to_string();
        if !text.is_empty() {
            segments.push(Segment {
                speaker: speaker.clone(),
                text,
                start: *timestamp,
                end: 0.0,
            });
        }
    }

    // Set end from next segment's start
    for i in 0..segments.len().saturating_sub(1) {
        segments[i].end = segments[i + 1].start;
    }

    segments
}

pub fn parse_timestamp(ts: &str) -> f64 {
    let parts: Vec<f64> = ts.split(':').map(|p| p.parse().unwrap_or(0.0)).collect();
    match parts.as_slice() {
        [m, s] => m * 60.0 + s,
        [h, m, s] => h * 3600.0 + m * 60.0 + s,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "---\ntitle: Interview with Ada\ndate: \"2026-01-15\"\ndecimal: \"50.01.01\"\ntags: [ai]\nguest: Ada\n---\n\n## Ada (00:30)\nHello there.\n\n## Bob (01:15)\nHi Ada.\n";

    #[test]
    fn frontmatter_and_segments() {
        let t = parse_markdown(SAMPLE, "interview.md").unwrap();
        assert_eq!(t.title, "Interview with Ada");
        assert_eq!(t.id, "20260115-interview-with-ada");
        assert_eq!(t.decimal.as_deref(), Some("50.01.01"));
        assert_eq!(t.tags, vec!["ai"]);
        assert_eq!(t.speakers, vec!["Ada", "Bob"]);
        assert_eq!(t.segments.len(), 2);
        assert_eq!(t.segments[0].start, 30.0);
        assert_eq!(t.segments[0].end, 75.0);
        assert_eq!(t.metadata.unwrap()["guest"], "Ada");
    }

    #[test]
    fn decimal_keeps_trailing_zeros() {
        let t = parse_markdown("---\ntitle: T\ndecimal: 50.10\n---\nbody", "t.md").unwrap();
        assert_eq!(t.decimal.as_deref(), Some("50.10"));

        let t = parse_markdown("---\ndecimal: 50.10.01 # talks\n---\nbody", "t.md").unwrap();
        assert_eq!(t.decimal.as_deref(), Some("50.10.01"));

        let t = parse_markdown("---\ndecimal: \"20.30\"\n---\nbody", "t.md").unwrap();
        assert_eq!(t.decimal.as_deref(), Some("20.30"));
    }

    #[test]
    fn plain_body_uses_filename_title() {
        let t = parse_markdown("Just some notes.", "team_sync-notes.md").unwrap();
        assert_eq!(t.title, "team sync notes");
        assert!(t.segments.is_empty());
        assert_eq!(t.text, "Just some notes.");
    }

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("01:02:03"), 3723.0);
        assert_eq!(parse_timestamp("2:05"), 125.0);
        assert_eq!(parse_timestamp("bad"), 0.0);
    }
}
