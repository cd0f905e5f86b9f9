pub mod models;
pub mod transcripts;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Well-known locations under the KB root (default ~/.kb).
#[derive(Debug, Clone)]
pub struct KbPaths {
    pub root: PathBuf,
}

impl KbPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.root.join("transcripts")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.config_dir().join("prompts")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.config_dir().join("registry.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn action_state_file(&self) -> PathBuf {
        self.state_dir().join("action-state.json")
    }

    pub fn feedback_file(&self) -> PathBuf {
        self.state_dir().join("prompt-feedback.json")
    }

    pub fn index_db(&self) -> PathBuf {
        self.root.join("index.db")
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("recordings")
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.transcripts_dir(),
            self.prompts_dir(),
            self.state_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Read a JSON document, returning `T::default()` when the file doesn't exist.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_json(path)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse: {}", path.display()))
}

/// Rewrite a JSON document wholesale. Writes to a sibling temp file and
/// renames it over the target so readers never see a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc.json");
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace: {}", path.display()))?;

    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let map: BTreeMap<String, String> =
            read_json_or_default(&dir.path().join("nope.json")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1);
        write_json_atomic(&path, &map).unwrap();
        map.insert("b".to_string(), 2);
        write_json_atomic(&path, &map).unwrap();

        let back: BTreeMap<String, i32> = read_json(&path).unwrap();
        assert_eq!(back.len(), 2);

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
