pub mod llm;
pub mod template;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

use crate::actions::ActionKind;
use crate::error::KbError;
use crate::ingest::markdown::split_frontmatter;
use crate::registry::Registry;
use crate::store::models::{AnalysisResult, Transcript};
use crate::store::transcripts::TranscriptStore;
use llm::LlmBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// One analysis type, loaded from `config/prompts/<name>.md`.
///
/// ```text
/// ---
/// label: LinkedIn Post
/// requires: [summary]
/// output: text
/// kind: auto_judge
/// actionable: true
/// judge: linkedin_judge
/// threshold: 8
/// ---
/// Write a LinkedIn post about {{title}} using:
/// {{summary}}
/// {{#if feedback}}Previous draft:
/// {{previous_draft}}
/// Reviewer feedback: {{feedback}}{{/if}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisType {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub output: OutputFormat,
    #[serde(default)]
    pub kind: ActionKind,
    #[serde(default)]
    pub actionable: bool,
    #[serde(default)]
    pub judge: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub template: String,
}

fn default_threshold() -> f64 {
    7.0
}

fn default_max_iterations() -> u32 {
    3
}

impl AnalysisType {
    /// Parse a prompt file. `stem` names the type when front matter doesn't.
    pub fn parse(content: &str, stem: &str) -> Result<Self> {
        let (frontmatter, body) = split_frontmatter(content);
        let mut ty: AnalysisType = match frontmatter {
            Some(fm) => serde_yaml::from_str(&fm)
                .with_context(|| format!("Invalid front matter in prompt: {stem}"))?,
            None => serde_yaml::from_str("{}")?,
        };
        if ty.name.is_empty() {
            ty.name = stem.to_string();
        }
        if ty.label.is_empty() {
            ty.label = ty.name.replace('_', " ");
        }
        if ty.name.contains("--") || ty.name.contains('/') {
            return Err(KbError::invalid("analysis name", &ty.name).into());
        }
        ty.template = body.trim().to_string();
        template::variables(&ty.template)
            .with_context(|| format!("Invalid template in prompt: {}", ty.name))?;
        Ok(ty)
    }
}

/// All known analysis types.
#[derive(Debug, Clone, Default)]
pub struct AnalysisCatalog {
    types: BTreeMap<String, AnalysisType>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

impl AnalysisCatalog {
    /// Load every `*.md` in the prompts directory. Missing directory = empty catalog.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut catalog = AnalysisCatalog::default();
        if !dir.exists() {
            return Ok(catalog);
        }

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts: {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        entries.sort();

        for path in entries {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read: {}", path.display()))?;
            catalog.insert(AnalysisType::parse(&content, &stem)?);
        }

        for ty in catalog.types.values() {
            for dep in &ty.requires {
                if !catalog.types.contains_key(dep) {
                    warn!("Analysis {} requires unknown type {dep}", ty.name);
                }
            }
        }

        Ok(catalog)
    }

    pub fn insert(&mut self, ty: AnalysisType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&AnalysisType> {
        self.types.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&AnalysisType, KbError> {
        self.get(name)
            .ok_or_else(|| KbError::UnknownAnalysis(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Order `requested` so every dependency precedes its dependents. Each
    /// type appears once. Unknown names and cycles are errors.
    pub fn resolve_order(&self, requested: &[String]) -> Result<Vec<String>, KbError> {
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut order: Vec<String> = Vec::new();

        for name in requested {
            self.visit(name, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), KbError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Err(KbError::DependencyCycle(cycle));
            }
            None => {}
        }

        let ty = self.require(name)?;
        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        for dep in &ty.requires {
            self.visit(dep, marks, path, order)?;
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        order.push(name.to_string());
        Ok(())
    }
}

/// Template context for a transcript: core fields plus every stored
/// analysis output under its type name.
pub fn prompt_context(t: &Transcript, registry: Option<&Registry>) -> Map<String, Value> {
    let mut ctx = Map::new();
    for (name, result) in &t.analysis {
        ctx.insert(name.clone(), result.output.clone());
    }

    ctx.insert("id".into(), Value::String(t.id.clone()));
    ctx.insert("title".into(), Value::String(t.title.clone()));
    ctx.insert("date".into(), Value::String(t.date.clone()));
    ctx.insert("transcript".into(), Value::String(t.text.clone()));
    ctx.insert("speakers".into(), Value::String(t.speakers.join(", ")));
    ctx.insert("tags".into(), Value::String(t.tags.join(", ")));
    if let Some(code) = &t.decimal {
        ctx.insert("decimal".into(), Value::String(code.clone()));
        if let Some(d) = registry.and_then(|r| r.get(code)) {
            ctx.insert("decimal_name".into(), Value::String(d.name.clone()));
        }
    }
    ctx
}

/// Turn a raw completion into a stored output value.
pub fn parse_output(format: OutputFormat, raw: &str) -> Result<Value, KbError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KbError::invalid("analysis output", "empty response"));
    }
    match format {
        OutputFormat::Text => Ok(Value::String(trimmed.to_string())),
        OutputFormat::Json => extract_json(trimmed).ok_or_else(|| {
            let preview: String = trimmed.chars().take(120).collect();
            KbError::invalid("analysis output", format!("expected JSON, got: {preview}"))
        }),
    }
}

/// Find a JSON object/array in model output that may be fenced or wrapped in prose.
fn extract_json(raw: &str) -> Option<Value> {
    let is_structured = |v: &Value| v.is_object() || v.is_array();

    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return is_structured(&v).then_some(v);
    }

    if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(after[..end].trim()) {
                if is_structured(&v) {
                    return Some(v);
                }
            }
        }
    }

    // Try the bracket that opens first, so `[{...}]` stays an array.
    let mut spans: Vec<(usize, char)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| raw.find(open).map(|s| (s, close)))
        .collect();
    spans.sort_by_key(|(s, _)| *s);
    for (s, close) in spans {
        if let Some(e) = raw.rfind(close) {
            if s < e {
                if let Ok(v) = serde_json::from_str::<Value>(&raw[s..=e]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Outcome of `Analyzer::run`.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub transcript_id: String,
    pub computed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Runs analysis types over transcripts and stores the results.
pub struct Analyzer<'a> {
    pub catalog: &'a AnalysisCatalog,
    pub store: &'a TranscriptStore,
    pub registry: &'a Registry,
    pub llm: &'a dyn LlmBackend,
}

impl<'a> Analyzer<'a> {
    /// Compute `requested` (and any missing dependencies) for one transcript.
    /// Present results are kept unless `force` is set for an explicitly
    /// requested type. The transcript is saved after every analysis.
    pub fn run(&self, transcript_id: &str, requested: &[String], force: bool) -> Result<RunReport> {
        let order = self.catalog.resolve_order(requested)?;
        let mut t = self.store.require(transcript_id)?;
        let mut report = RunReport {
            transcript_id: t.id.clone(),
            ..Default::default()
        };

        for name in order {
            let explicit = requested.contains(&name);
            if t.analysis.contains_key(&name) && !(force && explicit) {
                report.skipped.push(name);
                continue;
            }

            let ty = self.catalog.require(&name)?;
            let result = self
                .compute(&t, ty, &Map::new())
                .with_context(|| format!("Analysis {name} failed for {}", t.id))?;
            t.analysis.insert(name.clone(), result);
            self.store.save(&mut t)?;
            info!("Stored analysis {name} for {}", t.id);
            report.computed.push(name);
        }

        Ok(report)
    }

    /// Default analyses for a transcript, from its decimal in the registry.
    pub fn default_analyses(&self, t: &Transcript) -> Vec<String> {
        t.decimal
            .as_deref()
            .map(|code| self.registry.effective_analyses(code))
            .unwrap_or_default()
    }

    pub fn render_prompt(
        &self,
        t: &Transcript,
        ty: &AnalysisType,
        extra: &Map<String, Value>,
    ) -> Result<String> {
        let mut ctx = prompt_context(t, Some(self.registry));
        for (k, v) in extra {
            ctx.insert(k.clone(), v.clone());
        }
        Ok(template::render(&ty.template, &Value::Object(ctx))?)
    }

    /// Render, complete and validate one analysis without storing it.
    pub fn compute(
        &self,
        t: &Transcript,
        ty: &AnalysisType,
        extra: &Map<String, Value>,
    ) -> Result<AnalysisResult> {
        let prompt = self.render_prompt(t, ty, extra)?;
        let raw = self
            .llm
            .complete(ty.system.as_deref(), &prompt, ty.model.as_deref())?;
        let output = parse_output(ty.output, &raw)?;
        Ok(AnalysisResult {
            output,
            model: ty.model.clone().unwrap_or_else(|| self.llm.model().to_string()),
            analyzed_at: chrono::Utc::now().to_rfc3339(),
            prompt_version: ty.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ty(name: &str, requires: &[&str]) -> AnalysisType {
        let mut t = AnalysisType::parse("", name).unwrap();
        t.requires = requires.iter().map(|s| s.to_string()).collect();
        t
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_front_matter() {
        let content = "---\nlabel: LinkedIn Post\nrequires: [summary]\nkind: auto_judge\nactionable: true\njudge: post_judge\nthreshold: 8\n---\nWrite about {{title}}.\n";
        let t = AnalysisType::parse(content, "linkedin_post").unwrap();
        assert_eq!(t.name, "linkedin_post");
        assert_eq!(t.requires, vec!["summary"]);
        assert_eq!(t.kind, ActionKind::AutoJudge);
        assert_eq!(t.threshold, 8.0);
        assert_eq!(t.max_iterations, 3);
        assert_eq!(t.template, "Write about {{title}}.");
    }

    #[test]
    fn rejects_broken_templates() {
        assert!(AnalysisType::parse("{{#if x}}never closed", "bad").is_err());
    }

    #[test]
    fn dependencies_come_first_once() {
        let mut c = AnalysisCatalog::default();
        c.insert(ty("summary", &[]));
        c.insert(ty("themes", &["summary"]));
        c.insert(ty("post", &["summary", "themes"]));
        let order = c.resolve_order(&names(&["post", "summary"])).unwrap();
        assert_eq!(order, names(&["summary", "themes", "post"]));
    }

    #[test]
    fn cycles_are_reported_with_path() {
        let mut c = AnalysisCatalog::default();
        c.insert(ty("a", &["b"]));
        c.insert(ty("b", &["c"]));
        c.insert(ty("c", &["a"]));
        match c.resolve_order(&names(&["a"])) {
            Err(KbError::DependencyCycle(path)) => assert_eq!(path, names(&["a", "b", "c", "a"])),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let mut c = AnalysisCatalog::default();
        c.insert(ty("a", &["ghost"]));
        assert!(matches!(
            c.resolve_order(&names(&["a"])),
            Err(KbError::UnknownAnalysis(n)) if n == "ghost"
        ));
    }

    #[test]
    fn json_output_is_extracted_from_fences_and_prose() {
        let fenced = "Here you go:\n```json\n{\"score\": 8}\n```";
        assert_eq!(parse_output(OutputFormat::Json, fenced).unwrap(), json!({"score": 8}));
        let prose = "Result: [1, 2] hope that helps";
        assert_eq!(parse_output(OutputFormat::Json, prose).unwrap(), json!([1, 2]));
        assert!(parse_output(OutputFormat::Json, "no json here").is_err());
        assert!(parse_output(OutputFormat::Json, "42").is_err());
        assert!(parse_output(OutputFormat::Text, "   ").is_err());
    }

    #[test]
    fn prose_array_of_objects_stays_an_array() {
        let prose = "Here are the posts: [{\"a\": 1}, {\"b\": 2}] enjoy";
        assert_eq!(
            parse_output(OutputFormat::Json, prose).unwrap(),
            json!([{"a": 1}, {"b": 2}])
        );
        let object = "Verdict {\"tags\": [\"x\"]} done";
        assert_eq!(parse_output(OutputFormat::Json, object).unwrap(), json!({"tags": ["x"]}));
    }

    #[test]
    fn context_exposes_analysis_outputs() {
        let mut t = Transcript::new("Talk", "2026-01-01", crate::store::models::SourceKind::Audio);
        t.text = "hello".into();
        t.analysis.insert(
            "summary".into(),
            AnalysisResult {
                output: json!({"headline": "H"}),
                model: "m".into(),
                analyzed_at: String::new(),
                prompt_version: None,
            },
        );
        let ctx = Value::Object(prompt_context(&t, None));
        let out = template::render("{{title}}: {{summary.headline}} / {{transcript}}", &ctx).unwrap();
        assert_eq!(out, "Talk: H / hello");
    }
}
