pub mod json;
pub mod markdown;
pub mod text;

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::kb::Kb;
use crate::registry::validate_code;
use crate::store::models::Transcript;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Format {
    Markdown,
    Text,
}

impl Format {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "markdown" | "md" => Some(Format::Markdown),
            "text" | "txt" => Some(Format::Text),
            _ => None,
        }
    }

    pub fn detect_from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("md" | "markdown") => Some(Format::Markdown),
            Some("txt" | "text") => Some(Format::Text),
            _ => None,
        }
    }
}

/// Options shared by `kb import` entry points.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub decimal: Option<String>,
    pub tags: Vec<String>,
    pub format: Option<Format>,
    pub dry_run: bool,
}

/// Expand files, directories (recursively, sorted) and glob patterns into the
/// files `accept` keeps. Explicitly named files are always kept.
pub fn collect_files(paths: &[String], accept: &dyn Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, accept: &dyn Fn(&Path) -> bool, out: &mut Vec<PathBuf>) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                walk(&path, accept, out)?;
            } else if path.is_file() && accept(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    for path_str in paths {
        let path = Path::new(path_str);
        if path.is_dir() {
            walk(path, accept, &mut out)?;
        } else if path.is_file() {
            out.push(path.to_path_buf());
        } else {
            // Try glob pattern
            let matches: Vec<_> = glob::glob(path_str)
                .with_context(|| format!("Invalid path or glob pattern: {path_str}"))?
                .filter_map(|r| r.ok())
                .filter(|p| p.is_file() && accept(p))
                .collect();

            if matches.is_empty() {
                bail!("No files found matching: {path_str}");
            }
            out.extend(matches);
        }
    }
    Ok(out)
}

/// Import text/markdown transcripts from files, directories or globs.
/// Returns the ids of imported transcripts.
pub fn import_paths(kb: &Kb, paths: &[String], opts: &ImportOptions) -> Result<Vec<String>> {
    if let Some(code) = &opts.decimal {
        validate_code(code)?;
    }

    let accept = |p: &Path| opts.format.is_some() || Format::detect_from_extension(p).is_some();
    let files = collect_files(paths, &accept)?;

    let mut imported = Vec::new();
    for file in files {
        if let Some(id) = import_file(kb, &file, opts)? {
            imported.push(id);
        }
    }
    Ok(imported)
}

/// Import one transcript from stdin.
pub fn import_stdin(kb: &Kb, opts: &ImportOptions) -> Result<Option<String>> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .context("Failed to read from stdin")?;

    if content.trim().is_empty() {
        bail!("Empty input from stdin");
    }

    let format = opts.format.unwrap_or_else(|| {
        if content.trim_start().starts_with("---") {
            Format::Markdown
        } else {
            Format::Text
        }
    });

    let t = match format {
        Format::Markdown => markdown::parse_markdown(&content, "stdin")?,
        Format::Text => {
            let mut t = Transcript::new("stdin", "", crate::store::models::SourceKind::Text);
            t.text = content.trim().to_string();
            t
        }
    };
    store(kb, t, opts)
}

fn import_file(kb: &Kb, path: &Path, opts: &ImportOptions) -> Result<Option<String>> {
    let format = opts
        .format
        .or_else(|| Format::detect_from_extension(path))
        .with_context(|| format!("Cannot determine format for: {}", path.display()))?;

    let source = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();
    if let Some(existing) = kb.store.find_by_source(&source)? {
        info!("Skipping already imported: {} ({})", existing.title, existing.id);
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    let mut t = match format {
        Format::Markdown => markdown::parse_markdown(&content, filename)?,
        Format::Text => text::parse_text(&content, path)?,
    };
    t.source_path = Some(source);
    store(kb, t, opts)
}

fn store(kb: &Kb, mut t: Transcript, opts: &ImportOptions) -> Result<Option<String>> {
    if opts.decimal.is_some() {
        t.decimal = opts.decimal.clone();
    }
    if let Some(code) = &t.decimal {
        validate_code(code).with_context(|| format!("Bad decimal in {}", t.title))?;
    }
    for tag in &opts.tags {
        if !t.tags.contains(tag) {
            t.tags.push(tag.clone());
        }
    }

    if opts.dry_run {
        println!(
            "  [dry-run] Would import: {} ({}, {} words)",
            t.title,
            t.decimal.as_deref().unwrap_or("-"),
            t.word_count()
        );
        return Ok(None);
    }

    kb.add_transcript(&mut t)?;
    Ok(Some(t.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_from_dirs_and_globs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("one.md"), "x").unwrap();
        std::fs::write(dir.path().join("two.txt"), "x").unwrap();
        std::fs::write(dir.path().join("skip.mp3"), "x").unwrap();

        let accept = |p: &Path| Format::detect_from_extension(p).is_some();
        let files = collect_files(&[dir.path().display().to_string()], &accept).unwrap();
        assert_eq!(files.len(), 2);

        let pattern = format!("{}/*.txt", dir.path().display());
        let files = collect_files(&[pattern], &accept).unwrap();
        assert_eq!(files.len(), 1);

        let missing = format!("{}/*.docx", dir.path().display());
        assert!(collect_files(&[missing], &accept).is_err());
    }

    #[test]
    fn imports_once_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path().join("kb")).unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "---\ntitle: Notes\ndate: \"2026-02-01\"\n---\nBody").unwrap();

        let opts = ImportOptions {
            decimal: Some("20.01".into()),
            tags: vec!["ideas".into()],
            ..Default::default()
        };
        let paths = [file.display().to_string()];
        let ids = import_paths(&kb, &paths, &opts).unwrap();
        assert_eq!(ids, vec!["20260201-notes"]);
        assert!(import_paths(&kb, &paths, &opts).unwrap().is_empty());

        let t = kb.store.require("20260201-notes").unwrap();
        assert_eq!(t.decimal.as_deref(), Some("20.01"));
        assert_eq!(t.tags, vec!["ideas"]);
    }

    #[test]
    fn rejects_bad_decimal() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path()).unwrap();
        let opts = ImportOptions {
            decimal: Some("5.1".into()),
            ..Default::default()
        };
        assert!(import_paths(&kb, &[], &opts).is_err());
    }

    #[test]
    fn front_matter_decimals_are_kept_verbatim_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path().join("kb")).unwrap();
        let good = dir.path().join("good.md");
        std::fs::write(&good, "---\ntitle: Good\ndate: \"2026-03-01\"\ndecimal: 50.10\n---\nBody").unwrap();
        let bad = dir.path().join("bad.md");
        std::fs::write(&bad, "---\ntitle: Bad\ndecimal: 5.1\n---\nBody").unwrap();

        let opts = ImportOptions::default();
        let ids = import_paths(&kb, &[good.display().to_string()], &opts).unwrap();
        let t = kb.store.require(&ids[0]).unwrap();
        assert_eq!(t.decimal.as_deref(), Some("50.10"));

        assert!(import_paths(&kb, &[bad.display().to_string()], &opts).is_err());
        assert_eq!(kb.store.list().unwrap().len(), 1);
    }
}
