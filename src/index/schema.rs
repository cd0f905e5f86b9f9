use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: &str = "1";

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Version tracking
        CREATE TABLE IF NOT EXISTS kb_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per transcript JSON document
        CREATE TABLE IF NOT EXISTS transcripts (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            decimal TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL DEFAULT '',
            source_kind TEXT NOT NULL DEFAULT 'audio',
            duration_seconds REAL NOT NULL DEFAULT 0,
            -- comma-wrapped: ',ai,hiring,'
            tags TEXT NOT NULL DEFAULT ',',
            text TEXT NOT NULL DEFAULT '',
            -- concatenated analysis outputs
            analyses TEXT NOT NULL DEFAULT '',
            word_count INTEGER NOT NULL DEFAULT 0,
            indexed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_transcripts_date ON transcripts(date);
        CREATE INDEX IF NOT EXISTS idx_transcripts_decimal ON transcripts(decimal);

        -- FTS5 virtual table (content-sync mode)
        CREATE VIRTUAL TABLE IF NOT EXISTS transcripts_fts USING fts5(
            title,
            text,
            analyses,
            content='transcripts',
            content_rowid='rowid'
        );

        -- Triggers to keep FTS5 in sync with the content table

        CREATE TRIGGER IF NOT EXISTS transcripts_ai AFTER INSERT ON transcripts BEGIN
            INSERT INTO transcripts_fts(rowid, title, text, analyses)
            VALUES (new.rowid, new.title, new.text, new.analyses);
        END;

        CREATE TRIGGER IF NOT EXISTS transcripts_ad AFTER DELETE ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, title, text, analyses)
            VALUES ('delete', old.rowid, old.title, old.text, old.analyses);
        END;

        CREATE TRIGGER IF NOT EXISTS transcripts_au AFTER UPDATE ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, title, text, analyses)
            VALUES ('delete', old.rowid, old.title, old.text, old.analyses);
            INSERT INTO transcripts_fts(rowid, title, text, analyses)
            VALUES (new.rowid, new.title, new.text, new.analyses);
        END;
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO kb_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
