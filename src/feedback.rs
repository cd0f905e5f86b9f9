use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::KbError;
use crate::store::{read_json_or_default, write_json_atomic};

/// A reviewer's complaint about one analysis output, used to improve prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flag {
    pub id: String,
    pub analysis_type: String,
    pub transcript_id: String,
    pub reason: String,
    pub flagged_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

/// `state/prompt-feedback.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackLog {
    #[serde(default)]
    pub flags: Vec<Flag>,
}

impl FeedbackLog {
    pub fn load(path: &Path) -> Result<Self> {
        read_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn flag(&mut self, transcript_id: &str, analysis_type: &str, reason: &str) -> Result<Flag, KbError> {
        if reason.trim().is_empty() {
            return Err(KbError::invalid("flag", "reason must not be empty"));
        }
        let flag = Flag {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            analysis_type: analysis_type.to_string(),
            transcript_id: transcript_id.to_string(),
            reason: reason.trim().to_string(),
            flagged_at: chrono::Utc::now().to_rfc3339(),
            resolved_at: None,
        };
        self.flags.push(flag.clone());
        Ok(flag)
    }

    /// Flags, newest first.
    pub fn list(&self, analysis_type: Option<&str>, include_resolved: bool) -> Vec<&Flag> {
        let mut out: Vec<&Flag> = self
            .flags
            .iter()
            .filter(|f| analysis_type.map_or(true, |t| f.analysis_type == t))
            .filter(|f| include_resolved || f.resolved_at.is_none())
            .collect();
        out.sort_by(|a, b| b.flagged_at.cmp(&a.flagged_at));
        out
    }

    pub fn resolve(&mut self, id: &str) -> Result<&Flag, KbError> {
        let flag = self
            .flags
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| KbError::not_found("flag", id))?;
        if flag.resolved_at.is_none() {
            flag.resolved_at = Some(chrono::Utc::now().to_rfc3339());
        }
        Ok(flag)
    }

    /// Open flag count per analysis type.
    pub fn open_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for f in self.flags.iter().filter(|f| f.resolved_at.is_none()) {
            *counts.entry(f.analysis_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}
