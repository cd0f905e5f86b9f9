pub mod filters;

use anyhow::Result;
use serde::Serialize;

use crate::index::SearchIndex;
use filters::Filters;

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptHit {
    pub id: String,
    pub title: String,
    pub decimal: String,
    pub date: String,
    pub source_kind: String,
    pub duration_seconds: f64,
    pub rank: f64,
    pub snippet: String,
}

impl SearchIndex {
    /// Search transcripts using FTS5. Returns BM25-ranked hits with snippets.
    pub fn search(&self, query: &str, filters: &Filters, limit: usize) -> Result<Vec<TranscriptHit>> {
        // ?1 is the query
        let (filter_conditions, filter_params) = filters.transcript_conditions(2);

        let mut where_parts = vec!["transcripts_fts MATCH ?1".to_string()];
        where_parts.extend(filter_conditions);
        let where_clause = where_parts.join(" AND ");

        let sql = format!(
            "SELECT t.id, t.title, t.decimal, t.date, t.source_kind, t.duration_seconds,
                    bm25(transcripts_fts, 5.0, 1.0, 2.0) AS rank,
                    snippet(transcripts_fts, -1, '>>>', '<<<', '...', 40) AS snippet
             FROM transcripts_fts
             JOIN transcripts t ON t.rowid = transcripts_fts.rowid
             WHERE {where_clause}
             ORDER BY rank
             LIMIT ?{}",
            filter_params.len() + 2
        );

        let mut all_params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        all_params.push(Box::new(query.to_string()));
        all_params.extend(filter_params);
        all_params.push(Box::new(limit as i64));

        self.query_hits(&sql, all_params)
    }

    /// List indexed transcripts with optional filters and sorting.
    pub fn list(&self, filters: &Filters, sort: &str, limit: usize) -> Result<Vec<TranscriptHit>> {
        let (filter_conditions, filter_params) = filters.transcript_conditions(1);

        let where_clause = if filter_conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filter_conditions.join(" AND "))
        };

        let order_by = match sort {
            "title" => "t.title ASC",
            "decimal" => "t.decimal ASC, t.date DESC",
            _ => "t.date DESC",
        };

        let sql = format!(
            "SELECT t.id, t.title, t.decimal, t.date, t.source_kind, t.duration_seconds, 0.0, ''
             FROM transcripts t
             {where_clause}
             ORDER BY {order_by}
             LIMIT ?{}",
            filter_params.len() + 1
        );

        let mut all_params = filter_params;
        all_params.push(Box::new(limit as i64));

        self.query_hits(&sql, all_params)
    }

    fn query_hits(
        &self,
        sql: &str,
        params: Vec<Box<dyn rusqlite::types::ToSql>>,
    ) -> Result<Vec<TranscriptHit>> {
        let mut stmt = self.conn.prepare(sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(TranscriptHit {
                id: row.get(0)?,
                title: row.get(1)?,
                decimal: row.get(2)?,
                date: row.get(3)?,
                source_kind: row.get(4)?,
                duration_seconds: row.get(5)?,
                rank: row.get(6)?,
                snippet: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{SourceKind, Transcript};

    fn index_with(ts: &[(&str, &str, &str, &str)]) -> (tempfile::TempDir, SearchIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = SearchIndex::open(&dir.path().join("index.db")).unwrap();
        for (title, decimal, text, tags) in ts {
            let mut t = Transcript::new(title, "2026-03-01T10:00:00Z", SourceKind::Audio);
            t.decimal = Some(decimal.to_string());
            t.text = text.to_string();
            t.tags = tags
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
            index.upsert(&t).unwrap();
        }
        (dir, index)
    }

    #[test]
    fn search_ranks_and_filters_by_decimal_prefix() {
        let (_dir, index) = index_with(&[
            ("Rust talk", "50.01.01", "ownership and borrowing", "rust"),
            ("Cooking", "60.01", "borrowing a cup of sugar", ""),
            ("Unrelated", "50.02", "nothing here", ""),
        ]);

        let hits = index.search("borrowing", &Filters::default(), 10).unwrap();
        assert_eq!(hits.len(), 2);

        let filters = Filters {
            decimal: Some("50.01".into()),
            ..Default::default()
        };
        let hits = index.search("borrowing", &filters, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Rust talk");
        assert!(hits[0].snippet.contains(">>>borrowing<<<"));
    }

    #[test]
    fn tag_filter_matches_whole_tags() {
        let (_dir, index) = index_with(&[
            ("A", "10", "x", "rust,talks"),
            ("B", "10", "x", "rusty"),
        ]);
        let filters = Filters {
            tag: Some("rust".into()),
            ..Default::default()
        };
        let hits = index.list(&filters, "title", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "A");
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let (_dir, index) = index_with(&[]);
        let mut t = Transcript::new("Draft", "2026-01-01", SourceKind::Text);
        t.text = "alpha".into();
        index.upsert(&t).unwrap();
        t.text = "beta".into();
        index.upsert(&t).unwrap();

        assert!(index.search("alpha", &Filters::default(), 10).unwrap().is_empty());
        assert_eq!(index.search("beta", &Filters::default(), 10).unwrap().len(), 1);
        assert_eq!(index.stats().unwrap().transcripts, 1);

        assert!(index.remove(&t.id).unwrap());
        assert!(index.search("beta", &Filters::default(), 10).unwrap().is_empty());
    }

    #[test]
    fn to_date_bound_is_inclusive() {
        let (_dir, index) = index_with(&[("Day", "10", "x", "")]);
        let filters = Filters {
            to_date: Some("2026-03-01".into()),
            ..Default::default()
        };
        assert_eq!(index.list(&filters, "date", 10).unwrap().len(), 1);
    }
}
