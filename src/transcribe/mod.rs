//! Speech-to-text over an external recognizer executable.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::config::{resolve_credential, TranscriptionConfig};
use crate::ingest::collect_files;
use crate::ingest::json::{parse_whisper_json, RecognizedText};
use crate::ingest::markdown::filename_to_title;
use crate::ingest::text::file_date;
use crate::kb::Kb;
use crate::registry::validate_code;
use crate::store::models::{SourceKind, Transcript};

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "m4v", "avi"];
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "ogg", "aac", "opus"];

/// Per-run recognizer settings.
#[derive(Debug, Clone)]
pub struct RecognizeOptions {
    pub model: String,
    pub language: String,
    /// Set when diarizing.
    pub hf_token: Option<String>,
}

pub trait Transcriber: Send + Sync {
    /// Recognize one audio file.
    fn transcribe(&self, audio: &Path, opts: &RecognizeOptions) -> Result<RecognizedText>;
}

/// Runs a whisper-style executable that writes `<stem>.json` or `<stem>.txt`
/// into an output directory.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub diarize_args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, diarize_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            diarize_args,
        }
    }

    /// Locate the configured executable on PATH.
    pub fn from_config(cfg: &TranscriptionConfig) -> Result<Self> {
        let program = which::which(&cfg.command).with_context(|| {
            format!(
                "Transcription command not found: {}. Install it or set [transcription] command in config.toml",
                cfg.command
            )
        })?;
        Ok(Self::new(program, cfg.args.clone(), cfg.diarize_args.clone()))
    }

    pub fn build_args(&self, input: &Path, output_dir: &Path, opts: &RecognizeOptions) -> Vec<String> {
        let input = input.display().to_string();
        let output_dir = output_dir.display().to_string();
        let mut vars = vec![
            ("input", input.as_str()),
            ("output_dir", output_dir.as_str()),
            ("model", opts.model.as_str()),
            ("language", opts.language.as_str()),
        ];
        let mut args = expand_args(&self.args, &vars);
        if let Some(token) = &opts.hf_token {
            vars.push(("hf_token", token.as_str()));
            args.extend(expand_args(&self.diarize_args, &vars));
        }
        args
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&self, audio: &Path, opts: &RecognizeOptions) -> Result<RecognizedText> {
        let work = WorkDir::new()?;
        let args = self.build_args(audio, work.path(), opts);
        debug!("Running {} {:?}", self.program.display(), args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {}", self.program.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} failed (exit {}): {}",
                self.program.display(),
                output.status.code().unwrap_or(-1),
                last_lines(&stderr, 5)
            );
        }

        let stem = audio
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Input file has no name")?;
        read_output(work.path(), stem)
    }
}

/// Replace `{name}` placeholders in each argument.
pub fn expand_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Read recognizer output for `stem`: JSON first, then plain text.
pub fn read_output(dir: &Path, stem: &str) -> Result<RecognizedText> {
    let json = dir.join(format!("{stem}.json"));
    if json.exists() {
        let content = std::fs::read_to_string(&json)
            .with_context(|| format!("Failed to read: {}", json.display()))?;
        return parse_whisper_json(&content);
    }

    let txt = dir.join(format!("{stem}.txt"));
    if txt.exists() {
        let content = std::fs::read_to_string(&txt)
            .with_context(|| format!("Failed to read: {}", txt.display()))?;
        return Ok(RecognizedText {
            text: content.trim().to_string(),
            ..Default::default()
        });
    }

    bail!("No transcription output ({stem}.json or {stem}.txt) in {}", dir.display())
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_video(path: &Path) -> bool {
    has_extension(path, VIDEO_EXTENSIONS)
}

pub fn is_media(path: &Path) -> bool {
    is_video(path) || has_extension(path, AUDIO_EXTENSIONS)
}

/// Extract a 16 kHz mono WAV track from a video.
pub fn convert_to_wav(ffmpeg: &str, input: &Path, output: &Path) -> Result<()> {
    let status = Command::new(ffmpeg)
        .args(["-y", "-loglevel", "error", "-i"])
        .arg(input)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-f", "wav"])
        .arg(output)
        .stdin(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {ffmpeg}. Is it installed?"))?;
    if !status.success() {
        bail!("{ffmpeg} could not convert {}", input.display());
    }
    Ok(())
}

/// HuggingFace token for diarization: flag > HF_TOKEN > config.
pub fn resolve_hf_token(flag: Option<&str>, cfg: &TranscriptionConfig) -> Result<String> {
    resolve_credential(
        flag,
        "HF_TOKEN",
        cfg.hf_token.as_deref(),
        cfg.hf_token_command.as_deref(),
    )
    .context("Diarization needs a HuggingFace token (--hf-token, HF_TOKEN or [transcription] hf_token)")
}

/// Scratch directory removed on drop.
struct WorkDir(PathBuf);

impl WorkDir {
    fn new() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("kb-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        Ok(Self(dir))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            debug!("Failed to clean {}: {e}", self.0.display());
        }
    }
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Build a transcript document from recognizer output.
pub fn transcript_from(
    source: &Path,
    recognized: RecognizedText,
    kind: SourceKind,
    model: &str,
) -> Transcript {
    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("recording");
    let mut t = Transcript::new(&filename_to_title(filename), &file_date(source), kind);
    t.duration_seconds = recognized.duration_seconds();
    t.diarized = recognized.is_diarized();
    t.model = Some(model.to_string());
    t.language = recognized.language;
    t.text = recognized.text;
    t.segments = recognized.segments;
    t.collect_speakers();
    t
}

/// Options for `kb transcribe`.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub decimal: Option<String>,
    pub tags: Vec<String>,
    pub model: Option<String>,
    pub diarize: bool,
    pub hf_token: Option<String>,
    pub force: bool,
    pub dry_run: bool,
}

/// Transcribe media files, directories or globs into the store.
/// Sources already transcribed are skipped unless `force`, which replaces
/// the earlier document and its ledger entries. Returns the new ids.
pub fn transcribe_paths(
    kb: &Kb,
    transcriber: &dyn Transcriber,
    paths: &[String],
    opts: &TranscribeOptions,
) -> Result<Vec<String>> {
    if let Some(code) = &opts.decimal {
        validate_code(code)?;
    }
    let cfg = &kb.config.transcription;

    let hf_token = if opts.diarize || cfg.diarize {
        Some(resolve_hf_token(opts.hf_token.as_deref(), cfg)?)
    } else {
        None
    };
    let recognize = RecognizeOptions {
        model: opts.model.clone().unwrap_or_else(|| cfg.model.clone()),
        language: cfg.language.clone(),
        hf_token,
    };

    let files = collect_files(paths, &|p: &Path| is_media(p))?;
    let mut done = Vec::new();
    for file in files {
        let source = std::fs::canonicalize(&file)
            .unwrap_or_else(|_| file.clone())
            .display()
            .to_string();

        let existing = kb.store.find_by_source(&source)?;
        if let Some(t) = &existing {
            if !opts.force {
                info!("Skipping already transcribed: {} ({})", t.title, t.id);
                continue;
            }
        }

        if opts.dry_run {
            println!("  [dry-run] Would transcribe: {}", file.display());
            continue;
        }

        match transcribe_file(kb, transcriber, &file, &recognize) {
            Ok(mut t) => {
                t.source_path = Some(source);
                t.decimal = opts.decimal.clone();
                t.tags = opts.tags.clone();
                if let Some(old) = existing {
                    kb.delete_transcript(&old.id)?;
                }
                kb.add_transcript(&mut t)?;
                info!("Transcribed {} -> {}", file.display(), t.id);
                done.push(t.id);
            }
            Err(e) => warn!("Failed to transcribe {}: {e:#}", file.display()),
        }
    }
    Ok(done)
}

fn transcribe_file(
    kb: &Kb,
    transcriber: &dyn Transcriber,
    file: &Path,
    opts: &RecognizeOptions,
) -> Result<Transcript> {
    if !is_video(file) {
        let recognized = transcriber.transcribe(file, opts)?;
        return Ok(transcript_from(file, recognized, SourceKind::Audio, &opts.model));
    }

    let work = WorkDir::new()?;
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("audio");
    let wav = work.path().join(format!("{stem}.wav"));
    convert_to_wav(&kb.config.transcription.ffmpeg, file, &wav)?;
    let recognized = transcriber.transcribe(&wav, opts)?;
    Ok(transcript_from(file, recognized, SourceKind::Video, &opts.model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn opts(token: Option<&str>) -> RecognizeOptions {
        RecognizeOptions {
            model: "large-v3".into(),
            language: "en".into(),
            hf_token: token.map(|s| s.to_string()),
        }
    }

    #[test]
    fn args_expand_placeholders_and_diarization() {
        let cfg = TranscriptionConfig::default();
        let t = CommandTranscriber::new("whisperx", cfg.args.clone(), cfg.diarize_args.clone());

        let args = t.build_args(Path::new("/a/talk.wav"), Path::new("/tmp/out"), &opts(None));
        assert_eq!(args[0], "/a/talk.wav");
        assert!(args.contains(&"large-v3".to_string()));
        assert!(args.contains(&"/tmp/out".to_string()));
        assert!(!args.contains(&"--diarize".to_string()));

        let args = t.build_args(Path::new("/a/talk.wav"), Path::new("/tmp/out"), &opts(Some("hf_x")));
        assert!(args.ends_with(&["--diarize".into(), "--hf_token".into(), "hf_x".into()]));
    }

    #[test]
    fn reads_json_then_falls_back_to_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), " plain words \n").unwrap();
        assert_eq!(read_output(dir.path(), "a").unwrap().text, "plain words");

        std::fs::write(
            dir.path().join("a.json"),
            r#"{"text": "from json", "segments": [{"text": "from json", "start": 0, "end": 2.5}]}"#,
        )
        .unwrap();
        let r = read_output(dir.path(), "a").unwrap();
        assert_eq!(r.text, "from json");
        assert_eq!(r.duration_seconds(), 2.5);

        assert!(read_output(dir.path(), "missing").is_err());
    }

    #[test]
    fn media_detection() {
        assert!(is_video(Path::new("x/Talk.MOV")));
        assert!(is_media(Path::new("memo.m4a")));
        assert!(!is_media(Path::new("notes.md")));
    }

    #[cfg(unix)]
    #[test]
    fn command_transcriber_runs_executable() {
        let script = r#"printf '{"text":"hello there","segments":[{"text":"hello there","start":0,"end":1,"speaker":"SPEAKER_00"}]}' > "$1/$(basename "$0" .wav).json""#;
        let t = CommandTranscriber::new(
            "sh",
            vec!["-c".into(), script.into(), "{input}".into(), "{output_dir}".into()],
            vec![],
        );
        let r = t.transcribe(Path::new("/nowhere/talk.wav"), &opts(None)).unwrap();
        assert_eq!(r.text, "hello there");
        assert!(r.is_diarized());
    }

    struct Fake {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl Transcriber for Fake {
        fn transcribe(&self, audio: &Path, _opts: &RecognizeOptions) -> Result<RecognizedText> {
            self.calls.lock().unwrap().push(audio.to_path_buf());
            Ok(RecognizedText {
                text: "words words".into(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn skips_known_sources_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Kb::open(dir.path().join("kb")).unwrap();
        let audio = dir.path().join("memo.m4a");
        std::fs::write(&audio, b"fake").unwrap();
        let fake = Fake {
            calls: Mutex::new(Vec::new()),
        };
        let paths = [audio.display().to_string()];
        let o = TranscribeOptions {
            decimal: Some("10.01".into()),
            ..Default::default()
        };

        let ids = transcribe_paths(&kb, &fake, &paths, &o).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(transcribe_paths(&kb, &fake, &paths, &o).unwrap().is_empty());

        let forced = TranscribeOptions {
            force: true,
            ..o.clone()
        };
        let again = transcribe_paths(&kb, &fake, &paths, &forced).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(kb.store.list().unwrap().len(), 1);
        assert_eq!(fake.calls.lock().unwrap().len(), 2);

        let t = kb.store.require(&again[0]).unwrap();
        assert_eq!(t.decimal.as_deref(), Some("10.01"));
        assert_eq!(t.model.as_deref(), Some("large-v3"));
    }
}
