//! Derived SQLite FTS5 index over the transcript JSON documents.
//! The JSON files stay the system of record; this can always be rebuilt.

pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::store::models::Transcript;

pub struct SearchIndex {
    pub conn: Connection,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub transcripts: i64,
    pub words: i64,
    pub decimals: Vec<DecimalCount>,
    pub db_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecimalCount {
    pub decimal: String,
    pub count: i64,
}

impl SearchIndex {
    /// Open (or create) the index at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open index: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        schema::create_schema(&conn)?;

        Ok(SearchIndex {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Insert or refresh one transcript.
    pub fn upsert(&self, t: &Transcript) -> Result<()> {
        let tags = format!(",{},", t.tags.join(","));
        let analyses = t
            .analysis
            .values()
            .map(|r| r.as_text())
            .collect::<Vec<_>>()
            .join("\n\n");

        self.conn.execute(
            "INSERT INTO transcripts (id, title, decimal, date, source_kind, duration_seconds, tags, text, analyses, word_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                decimal = excluded.decimal,
                date = excluded.date,
                source_kind = excluded.source_kind,
                duration_seconds = excluded.duration_seconds,
                tags = excluded.tags,
                text = excluded.text,
                analyses = excluded.analyses,
                word_count = excluded.word_count,
                indexed_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            rusqlite::params![
                t.id,
                t.title,
                t.decimal.as_deref().unwrap_or(""),
                t.date,
                t.source_kind.as_str(),
                t.duration_seconds,
                tags,
                t.text,
                analyses,
                t.word_count() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM transcripts WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Drop everything and re-index `transcripts`.
    pub fn rebuild(&self, transcripts: &[Transcript]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM transcripts", [])?;
        for t in transcripts {
            self.upsert(t)?;
        }
        tx.execute_batch("INSERT INTO transcripts_fts(transcripts_fts) VALUES('rebuild');")?;
        tx.commit()?;
        info!("Index rebuilt with {} transcripts", transcripts.len());
        Ok(transcripts.len())
    }

    pub fn schema_version(&self) -> String {
        self.conn
            .query_row(
                "SELECT value FROM kb_meta WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Index statistics.
    pub fn stats(&self) -> Result<IndexStats> {
        let transcripts: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transcripts", [], |r| r.get(0))?;
        let words: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(word_count), 0) FROM transcripts",
            [],
            |r| r.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT decimal, COUNT(*) FROM transcripts GROUP BY decimal ORDER BY decimal",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DecimalCount {
                decimal: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut decimals = Vec::new();
        for row in rows {
            decimals.push(row?);
        }

        let db_size_bytes = std::fs::metadata(&self.path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(IndexStats {
            transcripts,
            words,
            decimals,
            db_size_bytes,
        })
    }
}
