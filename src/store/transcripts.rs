use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::models::{AnalysisResult, Transcript};
use super::{read_json, write_json_atomic};
use crate::error::KbError;

/// Directory of per-transcript JSON documents.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(KbError::invalid("transcript id", id).into());
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Get a single transcript by ID.
    pub fn get(&self, id: &str) -> Result<Option<Transcript>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    /// Like `get`, but a missing transcript is a `KbError::NotFound`.
    pub fn require(&self, id: &str) -> Result<Transcript> {
        self.get(id)?
            .ok_or_else(|| KbError::not_found("transcript", id).into())
    }

    /// All transcripts, newest first. Unreadable files are logged and skipped.
    pub fn list(&self) -> Result<Vec<Transcript>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory: {}", self.dir.display()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Transcript>(&path) {
                Ok(t) => out.push(t),
                Err(e) => warn!("Skipping unreadable transcript {}: {e:#}", path.display()),
            }
        }

        out.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Write a transcript, bumping `updated_at`.
    pub fn save(&self, t: &mut Transcript) -> Result<()> {
        t.updated_at = chrono::Utc::now().to_rfc3339();
        let path = self.path_for(&t.id)?;
        write_json_atomic(&path, t)
    }

    /// Insert a new transcript, suffixing the id (`-2`, `-3`, ...) on collision.
    pub fn insert(&self, t: &mut Transcript) -> Result<()> {
        let base = t.id.clone();
        let mut n = 2;
        while self.exists(&t.id) {
            t.id = format!("{base}-{n}");
            n += 1;
        }
        self.save(t)?;
        info!("Saved transcript: {} ({})", t.title, t.id);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to delete: {}", path.display()))?;
        Ok(true)
    }

    /// Find the transcript produced from a given source file, if any.
    pub fn find_by_source(&self, source_path: &str) -> Result<Option<Transcript>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|t| t.source_path.as_deref() == Some(source_path)))
    }

    /// Store one analysis result and persist the transcript.
    pub fn set_analysis(&self, id: &str, name: &str, result: AnalysisResult) -> Result<Transcript> {
        let mut t = self.require(id)?;
        t.analysis.insert(name.to_string(), result);
        self.save(&mut t)?;
        Ok(t)
    }
}

/// Ids are file stems: no separators, no dot-segments.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SourceKind;

    fn store() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().join("transcripts"));
        (dir, store)
    }

    #[test]
    fn insert_suffixes_colliding_ids() {
        let (_dir, store) = store();
        let mut a = Transcript::new("Standup", "2026-01-02", SourceKind::Audio);
        let mut b = Transcript::new("Standup", "2026-01-02", SourceKind::Audio);
        store.insert(&mut a).unwrap();
        store.insert(&mut b).unwrap();
        assert_eq!(a.id, "20260102-standup");
        assert_eq!(b.id, "20260102-standup-2");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn list_is_newest_first() {
        let (_dir, store) = store();
        for (title, date) in [("Old", "2025-01-01"), ("New", "2026-06-01")] {
            let mut t = Transcript::new(title, date, SourceKind::Text);
            store.insert(&mut t).unwrap();
        }
        let titles: Vec<_> = store.list().unwrap().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["New", "Old"]);
    }

    #[test]
    fn rejects_path_like_ids() {
        let (_dir, store) = store();
        assert!(store.get("../etc/passwd").is_err());
        assert!(store.get("a/b").is_err());
        assert!(store.get("fine-id").unwrap().is_none());
    }

    #[test]
    fn require_reports_not_found() {
        let (_dir, store) = store();
        let err = store.require("missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::NotFound { .. })
        ));
    }

    #[test]
    fn find_by_source_and_delete() {
        let (_dir, store) = store();
        let mut t = Transcript::new("Talk", "2026-02-02", SourceKind::Video);
        t.source_path = Some("/archive/talk.mp4".to_string());
        store.insert(&mut t).unwrap();

        let found = store.find_by_source("/archive/talk.mp4").unwrap().unwrap();
        assert_eq!(found.id, t.id);
        assert!(store.delete(&t.id).unwrap());
        assert!(!store.delete(&t.id).unwrap());
    }
}
