use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use super::{ActionEvent, ActionKey, ActionKind, ActionLedger, ActionRecord, ActionStatus, View};
use crate::analysis::AnalysisCatalog;
use crate::error::KbError;
use crate::store::models::Transcript;
use crate::store::transcripts::TranscriptStore;

/// One (transcript, actionable analysis) pair as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ActionItem {
    pub id: String,
    pub transcript_id: String,
    pub transcript_title: String,
    pub decimal: Option<String>,
    pub date: String,
    pub analysis_type: String,
    pub label: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    pub view: View,
    pub output: serde_json::Value,
    pub record: ActionRecord,
}

/// Filters for `list_items`.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub view: Option<View>,
    /// Decimal prefix: `50.01` matches `50.01` and `50.01.03`.
    pub decimal: Option<String>,
    pub analysis_type: Option<String>,
}

impl QueueFilter {
    fn matches_decimal(&self, t: &Transcript) -> bool {
        match (&self.decimal, &t.decimal) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(want), Some(have)) => {
                have == want || have.starts_with(&format!("{want}."))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ViewCounts {
    pub queue: usize,
    pub review: usize,
    pub posting: usize,
    pub archive: usize,
}

fn build_item(
    t: &Transcript,
    name: &str,
    catalog: &AnalysisCatalog,
    ledger: &ActionLedger,
) -> Option<ActionItem> {
    let ty = catalog.get(name).filter(|ty| ty.actionable)?;
    let result = t.analysis.get(name)?;
    let key = ActionKey::new(&t.id, name);
    let record = ledger.record(&key);
    Some(ActionItem {
        id: key.to_string(),
        transcript_id: t.id.clone(),
        transcript_title: t.title.clone(),
        decimal: t.decimal.clone(),
        date: t.date.clone(),
        analysis_type: name.to_string(),
        label: ty.label.clone(),
        kind: ty.kind,
        status: record.status,
        view: record.status.view(),
        output: result.output.clone(),
        record,
    })
}

/// Join transcripts × actionable analyses × ledger, newest transcripts first.
pub fn list_items(
    transcripts: &[Transcript],
    catalog: &AnalysisCatalog,
    ledger: &ActionLedger,
    filter: &QueueFilter,
) -> Vec<ActionItem> {
    let mut items = Vec::new();
    for t in transcripts {
        if !filter.matches_decimal(t) {
            continue;
        }
        for name in t.analysis.keys() {
            if filter
                .analysis_type
                .as_deref()
                .is_some_and(|want| want != name)
            {
                continue;
            }
            if let Some(item) = build_item(t, name, catalog, ledger) {
                if filter.view.map_or(true, |v| v == item.view) {
                    items.push(item);
                }
            }
        }
    }
    items.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    items
}

pub fn count_views(items: &[ActionItem]) -> ViewCounts {
    let mut counts = ViewCounts::default();
    for item in items {
        match item.view {
            View::Queue => counts.queue += 1,
            View::Review => counts.review += 1,
            View::Posting => counts.posting += 1,
            View::Archive => counts.archive += 1,
        }
    }
    counts
}

/// Look up one item. The transcript must exist and carry an actionable analysis.
pub fn get_item(
    store: &TranscriptStore,
    catalog: &AnalysisCatalog,
    ledger: &ActionLedger,
    key: &ActionKey,
) -> Result<ActionItem> {
    let t = store.require(&key.transcript_id)?;
    build_item(&t, &key.analysis_type, catalog, ledger)
        .ok_or_else(|| KbError::not_found("action", key.to_string()).into())
}

/// Load the ledger, apply `event` to one item, save, and return the updated item.
pub fn apply_event(
    store: &TranscriptStore,
    catalog: &AnalysisCatalog,
    ledger_path: &Path,
    key: &ActionKey,
    event: ActionEvent,
) -> Result<ActionItem> {
    let mut ledger = ActionLedger::load(ledger_path)?;
    let item = get_item(store, catalog, &ledger, key)?;
    let rec = ledger.apply(key, item.kind, event)?;
    ledger.save(ledger_path)?;
    info!("{key}: {} -> {}", item.status, rec.status);
    get_item(store, catalog, &ledger, key)
}
