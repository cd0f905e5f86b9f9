use std::collections::BTreeMap;
use unicode_width::UnicodeWidthStr;

use crate::actions::queue::{ActionItem, ViewCounts};
use crate::analysis::{AnalysisCatalog, RunReport};
use crate::feedback::Flag;
use crate::index::IndexStats;
use crate::registry::Registry;
use crate::search::TranscriptHit;
use crate::store::models::{Segment, Transcript};

/// Format duration in seconds to human-readable string.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Truncate a string to fit within max_width (respecting unicode width).
fn truncate(s: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(s) <= max_width {
        return s.to_string();
    }
    let mut result = String::new();
    let mut width = 0;
    for ch in s.chars() {
        let cw = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + cw + 3 > max_width {
            result.push_str("...");
            break;
        }
        result.push(ch);
        width += cw;
    }
    result
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn short_date(date: &str) -> &str {
    date.get(..10).unwrap_or(date)
}

fn print_hit_header() {
    println!(
        "  {:<42} {:<12} {:<10} {:<8}",
        "TITLE", "DATE", "DECIMAL", "DURATION"
    );
    println!("  {}", "-".repeat(76));
}

fn print_hit_row(r: &TranscriptHit) {
    println!(
        "  {:<42} {:<12} {:<10} {:<8}",
        truncate(&r.title, 40),
        short_date(&r.date),
        if r.decimal.is_empty() { "-" } else { &r.decimal },
        format_duration(r.duration_seconds),
    );
}

/// Format transcript search results as a table.
pub fn print_search_results(results: &[TranscriptHit], query: &str) {
    if results.is_empty() {
        println!("No results for \"{query}\"");
        return;
    }

    println!(
        "{} result{} for \"{}\":\n",
        results.len(),
        plural(results.len()),
        query
    );
    print_hit_header();

    for r in results {
        print_hit_row(r);
        if !r.snippet.is_empty() {
            let snippet = r.snippet.replace('\n', " ");
            println!("  {}", truncate(&format!("  {snippet}"), 76));
        }
        println!("  id: {}\n", r.id);
    }
}

/// Format transcript list as a table.
pub fn print_transcript_list(results: &[TranscriptHit]) {
    if results.is_empty() {
        println!("No transcripts found.");
        return;
    }

    println!("{} transcript{}:\n", results.len(), plural(results.len()));
    print_hit_header();
    for r in results {
        print_hit_row(r);
        println!("  id: {}\n", r.id);
    }
}

/// Format a single transcript's details for `kb show`.
pub fn print_transcript_detail(t: &Transcript, registry: &Registry) {
    println!("Transcript: {}", t.title);
    println!("  ID:       {}", t.id);
    println!("  Date:     {}", t.date);
    if let Some(code) = &t.decimal {
        println!("  Decimal:  {}", registry.label(code));
    }
    println!("  Source:   {}", t.source_kind.as_str());
    if let Some(path) = &t.source_path {
        println!("  File:     {path}");
    }
    println!("  Duration: {}", format_duration(t.duration_seconds));
    println!("  Words:    {}", t.word_count());
    if let Some(model) = &t.model {
        println!(
            "  Model:    {model}{}",
            if t.diarized { " (diarized)" } else { "" }
        );
    }
    if !t.speakers.is_empty() {
        println!("  Speakers: {}", t.speakers.join(", "));
    }
    if !t.tags.is_empty() {
        println!("  Tags:     {}", t.tags.join(", "));
    }

    if !t.analysis.is_empty() {
        println!("\nAnalyses:");
        for (name, result) in &t.analysis {
            println!("  {name} ({}, {})", result.model, short_date(&result.analyzed_at));
            let text = result.as_text();
            for line in text.lines().take(6) {
                println!("    {}", truncate(line, 76));
            }
            if text.lines().count() > 6 {
                println!("    ...");
            }
        }
    }
}

/// Format segments for `kb show --segments`.
pub fn print_segments(segments: &[Segment], speaker_filter: Option<&str>) {
    if segments.is_empty() {
        println!("No segments.");
        return;
    }

    let filtered: Vec<&Segment> = if let Some(speaker) = speaker_filter {
        let lower = speaker.to_lowercase();
        segments
            .iter()
            .filter(|s| s.speaker.to_lowercase().contains(&lower))
            .collect()
    } else {
        segments.iter().collect()
    };

    println!("{} segment{}:\n", filtered.len(), plural(filtered.len()));

    let mut last_speaker = "";
    for seg in &filtered {
        let time = format_timestamp(seg.start);
        if seg.speaker != last_speaker || last_speaker.is_empty() {
            if !last_speaker.is_empty() {
                println!();
            }
            let who = if seg.speaker.is_empty() { "-" } else { &seg.speaker };
            println!("  {who} [{time}]:");
            last_speaker = seg.speaker.as_str();
        }
        println!("    {}", seg.text);
    }
    println!();
}

/// Format action items for `kb actions list`.
pub fn print_action_items(items: &[ActionItem], counts: &ViewCounts) {
    println!(
        "queue {}  review {}  posting {}  archive {}\n",
        counts.queue, counts.review, counts.posting, counts.archive
    );
    if items.is_empty() {
        println!("No items.");
        return;
    }

    println!(
        "  {:<9} {:<22} {:<36} {:<10}",
        "STATUS", "TYPE", "TRANSCRIPT", "DECIMAL"
    );
    println!("  {}", "-".repeat(80));
    for it in items {
        println!(
            "  {:<9} {:<22} {:<36} {:<10}",
            it.status.as_str(),
            truncate(&it.analysis_type, 22),
            truncate(&it.transcript_title, 36),
            it.decimal.as_deref().unwrap_or("-"),
        );
        println!("  id: {}\n", it.id);
    }
}

/// Full view of one action item.
pub fn print_action_detail(it: &ActionItem) {
    println!("{} · {}", it.label, it.transcript_title);
    println!("  ID:     {}", it.id);
    println!("  Status: {} ({:?})", it.status, it.view);
    println!("  Kind:   {}", serde_plain(&it.kind));
    for (label, ts) in [
        ("Staged", &it.record.staged_at),
        ("Ready", &it.record.ready_at),
        ("Posted", &it.record.posted_at),
        ("Done", &it.record.completed_at),
        ("Skipped", &it.record.skipped_at),
    ] {
        if let Some(ts) = ts {
            println!("  {label:<7} {ts}");
        }
    }
    for i in &it.record.iterations {
        let score = i.score.map(|s| format!(" score {s}")).unwrap_or_default();
        let feedback = i
            .feedback
            .as_deref()
            .map(|f| format!(": {}", truncate(f, 60)))
            .unwrap_or_default();
        println!("  round {}{score}{feedback}", i.round);
    }

    println!();
    match &it.output {
        serde_json::Value::String(s) => println!("{s}"),
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_default()
        ),
    }
}

fn serde_plain<T: serde::Serialize>(v: &T) -> String {
    serde_json::to_value(v)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

pub fn print_run_report(report: &RunReport) {
    if report.computed.is_empty() {
        println!("{}: up to date", report.transcript_id);
    } else {
        println!(
            "{}: computed {}",
            report.transcript_id,
            report.computed.join(", ")
        );
    }
}

pub fn print_registry(registry: &Registry) {
    if registry.decimals.is_empty() {
        println!("No decimals registered. Add one with `kb registry add <code> <name>`.");
    }
    for (code, d) in &registry.decimals {
        let depth = code.matches('.').count();
        let defaults = if d.default_analyses.is_empty() {
            String::new()
        } else {
            format!("  [{}]", d.default_analyses.join(", "))
        };
        println!("{}{code}  {}{defaults}", "  ".repeat(depth), d.name);
        if !d.description.is_empty() {
            println!("{}      {}", "  ".repeat(depth), truncate(&d.description, 70));
        }
    }

    if !registry.tags.is_empty() {
        println!("\nTags:");
        for (name, tag) in &registry.tags {
            println!("  {name:<20} {}", truncate(&tag.description, 56));
        }
    }
}

pub fn print_prompts(catalog: &AnalysisCatalog, open_flags: &BTreeMap<String, usize>) {
    if catalog.is_empty() {
        println!("No analysis types. Add prompt files to config/prompts/.");
        return;
    }
    println!(
        "  {:<22} {:<11} {:<6} {:<28} {:<5}",
        "NAME", "KIND", "OUTPUT", "REQUIRES", "FLAGS"
    );
    println!("  {}", "-".repeat(76));
    for ty in catalog.iter() {
        let kind = if ty.actionable {
            serde_plain(&ty.kind)
        } else {
            "-".to_string()
        };
        println!(
            "  {:<22} {:<11} {:<6} {:<28} {:<5}",
            truncate(&ty.name, 22),
            kind,
            serde_plain(&ty.output),
            truncate(&ty.requires.join(","), 28),
            open_flags.get(&ty.name).copied().unwrap_or(0),
        );
    }
}

pub fn print_flags(flags: &[&Flag]) {
    if flags.is_empty() {
        println!("No feedback.");
        return;
    }
    for f in flags {
        let state = if f.resolved_at.is_some() { "resolved" } else { "open" };
        println!(
            "  {}  {:<20} {:<8} {}",
            f.id,
            truncate(&f.analysis_type, 20),
            state,
            short_date(&f.flagged_at)
        );
        println!("    {} ({})", truncate(&f.reason, 72), f.transcript_id);
    }
}

/// Print index and workflow stats.
pub fn print_stats(stats: &IndexStats, counts: &ViewCounts, registry: &Registry) {
    println!("Knowledge Base:");
    println!("  Transcripts:  {}", stats.transcripts);
    println!("  Words:        {}", stats.words);
    println!("  Index Size:   {}", format_bytes(stats.db_size_bytes));
    println!(
        "  Actions:      {} queued, {} in review, {} to post, {} archived",
        counts.queue, counts.review, counts.posting, counts.archive
    );
    println!("\n  Decimals:");
    for dc in &stats.decimals {
        let label = if dc.decimal.is_empty() {
            "(none)".to_string()
        } else {
            registry.label(&dc.decimal)
        };
        println!("    {:<40} {}", truncate(&label, 40), dc.count);
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds as u64;
    let m = total / 60;
    let s = total % 60;
    format!("{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(125.0), "2m05s");
        assert_eq!(format_duration(3720.0), "1h02m");
    }

    #[test]
    fn truncation_respects_wide_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        let wide = truncate("日本語のタイトル", 9);
        assert!(UnicodeWidthStr::width(wide.as_str()) <= 9);
        assert!(wide.ends_with("..."));
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
