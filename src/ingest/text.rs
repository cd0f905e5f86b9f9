use anyhow::Result;
use std::path::Path;

use super::markdown::filename_to_title;
use crate::store::models::{SourceKind, Transcript};

/// Parse a plain text transcript.
/// Title from filename, date from mtime, body = text, no segments.
pub fn parse_text(content: &str, filepath: &Path) -> Result<Transcript> {
    let filename = filepath
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled");
    let title = filename_to_title(filename);

    let date = file_date(filepath);
    let mut t = Transcript::new(&title, &date, SourceKind::Text);
    t.text = content.trim().to_string();
    Ok(t)
}

/// A file's mtime as RFC 3339, or empty when unavailable.
pub fn file_date(path: &Path) -> String {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .map(|t| {
            let dt: chrono::DateTime<chrono::Utc> = t.into();
            dt.to_rfc3339()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_from_filename_and_date_from_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weekly_review-notes.txt");
        std::fs::write(&path, "  line one\nline two  \n").unwrap();

        let t = parse_text(&std::fs::read_to_string(&path).unwrap(), &path).unwrap();
        assert_eq!(t.title, "weekly review notes");
        assert_eq!(t.text, "line one\nline two");
        assert!(!t.date.is_empty());
        assert_eq!(t.source_kind, SourceKind::Text);
    }
}
