use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use super::queue::{get_item, ActionItem};
use super::{next_status, ActionEvent, ActionKey, ActionKind, ActionLedger, Iteration};
use crate::analysis::{AnalysisType, Analyzer};
use crate::error::KbError;

/// A judge's opinion of one draft.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Verdict {
    pub score: f64,
    pub feedback: String,
    pub passed: bool,
}

#[derive(Debug, Serialize)]
pub struct RefineReport {
    pub item: ActionItem,
    pub verdicts: Vec<Verdict>,
    pub ready: bool,
}

/// Read `{score, feedback}` out of judge output. Scores may be numbers or
/// numeric strings; `notes`/`reason` are accepted for feedback.
pub fn parse_verdict(output: &Value, threshold: f64) -> Result<Verdict, KbError> {
    let score = match output.get("score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| KbError::invalid("judge output", "missing numeric \"score\""))?;

    let feedback = ["feedback", "notes", "reason"]
        .iter()
        .find_map(|k| output.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();

    Ok(Verdict {
        score,
        feedback,
        passed: score >= threshold,
    })
}

/// The judge/iterate loop for auto-judge items.
pub struct Refiner<'a> {
    pub analyzer: &'a Analyzer<'a>,
    pub ledger_path: &'a Path,
    /// Taken only while results are written back, never across an LLM call.
    /// State is re-read and re-validated under it.
    pub commit_lock: Option<&'a Mutex<()>>,
}

impl<'a> Refiner<'a> {
    fn commit_guard(&self) -> Option<MutexGuard<'a, ()>> {
        self.commit_lock
            .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn auto_judge_type(&self, key: &ActionKey) -> Result<&'a AnalysisType> {
        let ty = self.analyzer.catalog.require(&key.analysis_type)?;
        if ty.kind != ActionKind::AutoJudge {
            return Err(KbError::invalid(
                "action",
                format!("{} is not an auto-judge type", ty.name),
            )
            .into());
        }
        Ok(ty)
    }

    /// Regenerate the draft with reviewer feedback. Staged/ready → staged.
    pub fn iterate(&self, key: &ActionKey, feedback: Option<&str>) -> Result<ActionItem> {
        let ty = self.auto_judge_type(key)?;
        let store = self.analyzer.store;
        let ledger = ActionLedger::load(self.ledger_path)?;
        let item = get_item(store, self.analyzer.catalog, &ledger, key)?;
        // Validate before spending an LLM call.
        next_status(item.status, ty.kind, ActionEvent::Iterate)?;

        let t = store.require(&key.transcript_id)?;
        let previous = t
            .analysis
            .get(&ty.name)
            .map(|r| r.as_text())
            .unwrap_or_default();
        let round = ledger.record(key).iterations.last().map_or(1, |i| i.round + 1);

        let mut extra = Map::new();
        extra.insert("previous_draft".into(), Value::String(previous));
        extra.insert(
            "feedback".into(),
            Value::String(feedback.unwrap_or_default().to_string()),
        );
        extra.insert("round".into(), Value::from(round));

        let result = self
            .analyzer
            .compute(&t, ty, &extra)
            .with_context(|| format!("Iteration {round} failed for {key}"))?;

        let _commit = self.commit_guard();
        let mut ledger = ActionLedger::load(self.ledger_path)?;
        ledger.apply(key, ty.kind, ActionEvent::Iterate)?;
        let mut t = store.require(&key.transcript_id)?;
        t.analysis.insert(ty.name.clone(), result);
        store.save(&mut t)?;

        ledger.record_mut(key).iterations.push(Iteration {
            round,
            feedback: feedback.map(|f| f.to_string()),
            score: None,
            at: chrono::Utc::now().to_rfc3339(),
        });
        ledger.save(self.ledger_path)?;
        info!("{key}: iteration {round} stored");

        get_item(store, self.analyzer.catalog, &ledger, key)
    }

    /// Score the current draft. A passing score moves staged → ready.
    pub fn judge(&self, key: &ActionKey) -> Result<(Verdict, ActionItem)> {
        let ty = self.auto_judge_type(key)?;
        let judge_name = ty.judge.as_deref().ok_or_else(|| {
            KbError::invalid("action", format!("{} has no judge configured", ty.name))
        })?;
        let judge_ty = self.analyzer.catalog.require(judge_name)?;

        let store = self.analyzer.store;
        let ledger = ActionLedger::load(self.ledger_path)?;
        let item = get_item(store, self.analyzer.catalog, &ledger, key)?;
        // Only staged drafts are judged.
        next_status(item.status, ty.kind, ActionEvent::Ready)?;

        let t = store.require(&key.transcript_id)?;
        let draft = t
            .analysis
            .get(&ty.name)
            .map(|r| r.as_text())
            .unwrap_or_default();

        let mut extra = Map::new();
        extra.insert("draft".into(), Value::String(draft));
        extra.insert("analysis_type".into(), Value::String(ty.name.clone()));
        extra.insert("threshold".into(), Value::from(ty.threshold));

        let result = self
            .analyzer
            .compute(&t, judge_ty, &extra)
            .with_context(|| format!("Judge {judge_name} failed for {key}"))?;
        let verdict = parse_verdict(&result.output, ty.threshold)?;

        let _commit = self.commit_guard();
        let mut ledger = ActionLedger::load(self.ledger_path)?;
        let current = ledger.status(key);
        next_status(current, ty.kind, ActionEvent::Ready)?;
        let mut t = store.require(&key.transcript_id)?;
        t.analysis.insert(judge_name.to_string(), result);
        store.save(&mut t)?;

        let rec = ledger.record_mut(key);
        match rec.iterations.last_mut() {
            Some(last) => last.score = Some(verdict.score),
            None => rec.iterations.push(Iteration {
                round: 0,
                feedback: None,
                score: Some(verdict.score),
                at: chrono::Utc::now().to_rfc3339(),
            }),
        }
        if verdict.passed {
            ledger.apply(key, ty.kind, ActionEvent::Ready)?;
        }
        ledger.save(self.ledger_path)?;
        info!(
            score = verdict.score,
            passed = verdict.passed,
            "{key}: judged"
        );

        let item = get_item(store, self.analyzer.catalog, &ledger, key)?;
        Ok((verdict, item))
    }

    /// Alternate judge and iterate until the draft passes or the type's
    /// `max_iterations` revision rounds are used up. Exhausted items stay
    /// staged for a human.
    pub fn refine(&self, key: &ActionKey) -> Result<RefineReport> {
        let ty = self.auto_judge_type(key)?;
        let mut verdicts = Vec::new();

        loop {
            let (verdict, item) = self.judge(key)?;
            let passed = verdict.passed;
            verdicts.push(verdict);
            if passed {
                return Ok(RefineReport {
                    item,
                    verdicts,
                    ready: true,
                });
            }

            let revisions = item.record.iterations.iter().filter(|i| i.round > 0).count() as u32;
            if revisions >= ty.max_iterations {
                return Ok(RefineReport {
                    item,
                    verdicts,
                    ready: false,
                });
            }

            let feedback = verdicts
                .last()
                .map(|v| v.feedback.clone())
                .unwrap_or_default();
            self.iterate(key, Some(&feedback))?;
        }
    }
}
