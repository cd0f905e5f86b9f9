pub mod queue;
pub mod refine;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::KbError;
use crate::store::{read_json_or_default, write_json_atomic};

/// Lifecycle status of one action item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    New,
    Staged,
    Ready,
    Done,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::New => "new",
            ActionStatus::Staged => "staged",
            ActionStatus::Ready => "ready",
            ActionStatus::Done => "done",
            ActionStatus::Skipped => "skipped",
        }
    }

    /// The single dashboard view an item with this status belongs to.
    pub fn view(&self) -> View {
        match self {
            ActionStatus::New => View::Queue,
            ActionStatus::Staged => View::Review,
            ActionStatus::Ready => View::Posting,
            ActionStatus::Done | ActionStatus::Skipped => View::Archive,
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How approval behaves for an analysis type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Approving finishes the item.
    #[default]
    Simple,
    /// Approving stages the item for the judge/iterate loop before posting.
    AutoJudge,
}

/// Dashboard views. Every status maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Queue,
    Review,
    Posting,
    Archive,
}

impl View {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queue" | "new" => Some(View::Queue),
            "review" | "staged" => Some(View::Review),
            "posting" | "ready" => Some(View::Posting),
            "archive" | "done" | "skipped" => Some(View::Archive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionEvent {
    Approve,
    Ready,
    Posted,
    Done,
    Skip,
    Iterate,
    Reopen,
}

impl ActionEvent {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approve" => Some(ActionEvent::Approve),
            "ready" => Some(ActionEvent::Ready),
            "posted" => Some(ActionEvent::Posted),
            "done" => Some(ActionEvent::Done),
            "skip" => Some(ActionEvent::Skip),
            "iterate" => Some(ActionEvent::Iterate),
            "reopen" => Some(ActionEvent::Reopen),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionEvent::Approve => "approve",
            ActionEvent::Ready => "ready",
            ActionEvent::Posted => "posted",
            ActionEvent::Done => "done",
            ActionEvent::Skip => "skip",
            ActionEvent::Iterate => "iterate",
            ActionEvent::Reopen => "reopen",
        }
    }
}

/// The transition table. Anything not listed is rejected.
pub fn next_status(
    from: ActionStatus,
    kind: ActionKind,
    event: ActionEvent,
) -> Result<ActionStatus, KbError> {
    use ActionEvent as E;
    use ActionStatus as S;

    let to = match (event, from) {
        (E::Approve, S::New) => match kind {
            ActionKind::Simple => S::Done,
            ActionKind::AutoJudge => S::Staged,
        },
        (E::Ready, S::Staged) => S::Ready,
        (E::Posted, S::Staged | S::Ready) => S::Done,
        (E::Done, S::New | S::Staged | S::Ready) => S::Done,
        (E::Skip, S::New | S::Staged | S::Ready) => S::Skipped,
        (E::Iterate, S::Staged | S::Ready) => S::Staged,
        (E::Reopen, S::Done | S::Skipped) => S::New,
        _ => {
            return Err(KbError::InvalidTransition {
                event: event.as_str().to_string(),
                from: from.as_str().to_string(),
            })
        }
    };
    Ok(to)
}

/// One round of the judge/iterate loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Iteration {
    pub round: u32,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    pub at: String,
}

/// Ledger entry for one action item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRecord {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<Iteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ActionRecord {
    /// Apply `event`, stamping the matching timestamp with `now`.
    pub fn apply(&mut self, kind: ActionKind, event: ActionEvent, now: &str) -> Result<(), KbError> {
        let to = next_status(self.status, kind, event)?;
        let stamp = || Some(now.to_string());

        match (event, to) {
            (ActionEvent::Approve, ActionStatus::Staged) => self.staged_at = stamp(),
            (ActionEvent::Approve, ActionStatus::Done) | (ActionEvent::Done, _) => {
                self.completed_at = stamp()
            }
            (ActionEvent::Ready, _) => self.ready_at = stamp(),
            (ActionEvent::Posted, _) => {
                self.posted_at = stamp();
                self.completed_at = stamp();
            }
            (ActionEvent::Skip, _) => self.skipped_at = stamp(),
            (ActionEvent::Iterate, _) => self.ready_at = None,
            (ActionEvent::Reopen, _) => {
                self.staged_at = None;
                self.ready_at = None;
                self.posted_at = None;
                self.completed_at = None;
                self.skipped_at = None;
            }
            _ => {}
        }

        self.status = to;
        self.updated_at = stamp();
        Ok(())
    }

    pub fn rounds(&self) -> u32 {
        self.iterations.len() as u32
    }
}

/// Composite key of an action item: `<transcript_id>--<analysis_type>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    pub transcript_id: String,
    pub analysis_type: String,
}

impl ActionKey {
    pub fn new(transcript_id: &str, analysis_type: &str) -> Self {
        Self {
            transcript_id: transcript_id.to_string(),
            analysis_type: analysis_type.to_string(),
        }
    }

    pub fn parse(id: &str) -> Result<Self, KbError> {
        match id.rsplit_once("--") {
            Some((t, a)) if !t.is_empty() && !a.is_empty() => Ok(Self::new(t, a)),
            _ => Err(KbError::invalid(
                "action id",
                format!("{id} (expected <transcript>--<analysis>)"),
            )),
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}", self.transcript_id, self.analysis_type)
    }
}

/// `state/action-state.json`: a flat map from action id to record.
/// Items without a record are `new`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionLedger {
    pub items: BTreeMap<String, ActionRecord>,
}

impl ActionLedger {
    pub fn load(path: &Path) -> Result<Self> {
        read_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn record(&self, key: &ActionKey) -> ActionRecord {
        self.items.get(&key.to_string()).cloned().unwrap_or_default()
    }

    pub fn status(&self, key: &ActionKey) -> ActionStatus {
        self.items
            .get(&key.to_string())
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn record_mut(&mut self, key: &ActionKey) -> &mut ActionRecord {
        self.items.entry(key.to_string()).or_default()
    }

    /// Transition one item and return its new record.
    pub fn apply(
        &mut self,
        key: &ActionKey,
        kind: ActionKind,
        event: ActionEvent,
    ) -> Result<ActionRecord, KbError> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut rec = self.record(key);
        rec.apply(kind, event, &now)?;
        self.items.insert(key.to_string(), rec.clone());
        Ok(rec)
    }

    /// Drop every record belonging to a transcript.
    pub fn forget_transcript(&mut self, transcript_id: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|k, _| {
            ActionKey::parse(k)
                .map(|key| key.transcript_id != transcript_id)
                .unwrap_or(true)
        });
        before - self.items.len()
    }
}
