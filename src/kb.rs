//! Handle on one KB root: paths, config and the transcript store, plus
//! loaders for the other JSON documents.

use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;

use crate::actions::ActionLedger;
use crate::analysis::AnalysisCatalog;
use crate::config::KbConfig;
use crate::feedback::FeedbackLog;
use crate::index::SearchIndex;
use crate::registry::Registry;
use crate::store::models::Transcript;
use crate::store::transcripts::TranscriptStore;
use crate::store::KbPaths;

pub struct Kb {
    pub paths: KbPaths,
    pub config: KbConfig,
    pub store: TranscriptStore,
}

impl Kb {
    /// Open a KB root, creating its directory skeleton if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = KbPaths::new(root);
        paths.ensure()?;
        let config = KbConfig::load(&paths.root)?;
        let store = TranscriptStore::new(paths.transcripts_dir());
        Ok(Kb {
            paths,
            config,
            store,
        })
    }

    pub fn registry(&self) -> Result<Registry> {
        Registry::load(&self.paths.registry_file())
    }

    pub fn catalog(&self) -> Result<AnalysisCatalog> {
        AnalysisCatalog::load(&self.paths.prompts_dir())
    }

    pub fn ledger(&self) -> Result<ActionLedger> {
        ActionLedger::load(&self.paths.action_state_file())
    }

    pub fn feedback(&self) -> Result<FeedbackLog> {
        FeedbackLog::load(&self.paths.feedback_file())
    }

    pub fn index(&self) -> Result<SearchIndex> {
        SearchIndex::open(&self.paths.index_db())
    }

    /// Store a new transcript and index it. Index failures are only logged;
    /// `kb index rebuild` recovers them.
    pub fn add_transcript(&self, t: &mut Transcript) -> Result<()> {
        self.store.insert(t)?;
        self.reindex(t);
        Ok(())
    }

    /// Refresh the index entry of a transcript already on disk.
    pub fn reindex(&self, t: &Transcript) {
        if let Err(e) = self.index().and_then(|idx| idx.upsert(t)) {
            warn!("Failed to index {}: {e:#}", t.id);
        }
    }

    pub fn reindex_id(&self, id: &str) -> Result<()> {
        let t = self.store.require(id)?;
        self.reindex(&t);
        Ok(())
    }

    /// Delete a transcript with its ledger entries and index row.
    pub fn delete_transcript(&self, id: &str) -> Result<bool> {
        if !self.store.delete(id)? {
            return Ok(false);
        }

        let path = self.paths.action_state_file();
        let mut ledger = ActionLedger::load(&path)?;
        if ledger.forget_transcript(id) > 0 {
            ledger.save(&path)?;
        }

        if let Err(e) = self.index().and_then(|idx| idx.remove(id)) {
            warn!("Failed to drop {id} from index: {e:#}");
        }
        Ok(true)
    }

    /// Rebuild the search index from the transcript documents.
    pub fn rebuild_index(&self) -> Result<usize> {
        let transcripts = self.store.list()?;
        self.index()?.rebuild(&transcripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionEvent, ActionKey, ActionKind};
    use crate::search::filters::Filters;
    use crate::store::models::SourceKind;

    #[test]
    fn add_and_delete_keep_index_and_ledger_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path()).unwrap();

        let mut t = Transcript::new("Standup", "2026-04-02T09:00:00Z", SourceKind::Audio);
        t.text = "quarterly roadmap".into();
        kb.add_transcript(&mut t).unwrap();

        let hits = kb.index().unwrap().search("roadmap", &Filters::default(), 5).unwrap();
        assert_eq!(hits.len(), 1);

        let key = ActionKey::new(&t.id, "todo");
        let mut ledger = kb.ledger().unwrap();
        ledger.apply(&key, ActionKind::Simple, ActionEvent::Skip).unwrap();
        ledger.save(&kb.paths.action_state_file()).unwrap();

        assert!(kb.delete_transcript(&t.id).unwrap());
        assert!(!kb.delete_transcript(&t.id).unwrap());
        assert!(kb.ledger().unwrap().items.is_empty());
        assert!(kb
            .index()
            .unwrap()
            .search("roadmap", &Filters::default(), 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rebuild_picks_up_documents_written_directly() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path()).unwrap();
        let mut t = Transcript::new("Loose", "2026-04-02", SourceKind::Text);
        kb.store.insert(&mut t).unwrap();
        assert_eq!(kb.rebuild_index().unwrap(), 1);
        assert_eq!(kb.index().unwrap().stats().unwrap().transcripts, 1);
    }
}
