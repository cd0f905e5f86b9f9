use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `[llm]` block of config.toml.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_key_command: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub retry_base_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_command: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            max_retries: 2,
            retry_base_secs: 10,
        }
    }
}

/// `[transcription]` block of config.toml.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Speech-recognition executable (looked up on PATH).
    pub command: String,
    /// Argument template. Placeholders: {input} {output_dir} {model} {language}
    pub args: Vec<String>,
    pub model: String,
    pub language: String,
    pub diarize: bool,
    /// Extra args appended when diarizing. Placeholder: {hf_token}
    pub diarize_args: Vec<String>,
    pub hf_token: Option<String>,
    pub hf_token_command: Option<String>,
    pub ffmpeg: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            command: "whisperx".to_string(),
            args: vec![
                "{input}".into(),
                "--model".into(),
                "{model}".into(),
                "--language".into(),
                "{language}".into(),
                "--output_dir".into(),
                "{output_dir}".into(),
                "--output_format".into(),
                "json".into(),
            ],
            model: "large-v3".to_string(),
            language: "en".to_string(),
            diarize: false,
            diarize_args: vec!["--diarize".into(), "--hf_token".into(), "{hf_token}".into()],
            hf_token: None,
            hf_token_command: None,
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// `[daemon]` block of config.toml.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    /// Recorder command; `{output}` is replaced with the WAV path.
    pub record_command: Vec<String>,
    /// Model used for dictation (usually smaller than the archive model).
    pub model: String,
    pub copy_command: Vec<String>,
    pub paste: bool,
    pub paste_command: Vec<String>,
    /// Also store each dictation in the KB as a `daemon` transcript.
    pub archive: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            record_command: vec![
                "rec".into(),
                "-q".into(),
                "-c".into(),
                "1".into(),
                "-r".into(),
                "16000".into(),
                "{output}".into(),
            ],
            model: "base.en".to_string(),
            copy_command: vec!["pbcopy".into()],
            paste: true,
            paste_command: vec![
                "osascript".into(),
                "-e".into(),
                "tell application \"System Events\" to keystroke \"v\" using command down".into(),
            ],
            archive: false,
        }
    }
}

/// `[server]` block of config.toml.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5111,
        }
    }
}

/// Top-level kb config file structure.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct KbConfig {
    pub llm: LlmConfig,
    pub transcription: TranscriptionConfig,
    pub daemon: DaemonConfig,
    pub server: ServerConfig,
}

impl KbConfig {
    /// Load config from `<root>/config.toml`. Returns default if file doesn't exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            return Ok(KbConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: KbConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config.toml")?;
        Ok(config)
    }

    /// Display config with secrets redacted.
    pub fn display_redacted(&self) -> String {
        let mut lines = Vec::new();

        lines.push("[llm]".to_string());
        push_secret(&mut lines, "api_key", self.llm.api_key.as_deref());
        push_opt(&mut lines, "api_key_command", self.llm.api_key_command.as_deref());
        lines.push(format!("  base_url = \"{}\"", self.llm.base_url));
        lines.push(format!("  model = \"{}\"", self.llm.model));
        lines.push(format!("  max_retries = {}", self.llm.max_retries));

        lines.push("[transcription]".to_string());
        lines.push(format!("  command = \"{}\"", self.transcription.command));
        lines.push(format!("  model = \"{}\"", self.transcription.model));
        lines.push(format!("  diarize = {}", self.transcription.diarize));
        push_secret(&mut lines, "hf_token", self.transcription.hf_token.as_deref());
        push_opt(
            &mut lines,
            "hf_token_command",
            self.transcription.hf_token_command.as_deref(),
        );

        lines.push("[daemon]".to_string());
        lines.push(format!("  record_command = {:?}", self.daemon.record_command));
        lines.push(format!("  model = \"{}\"", self.daemon.model));
        lines.push(format!("  paste = {}", self.daemon.paste));
        lines.push(format!("  archive = {}", self.daemon.archive));

        lines.push("[server]".to_string());
        lines.push(format!("  {}:{}", self.server.host, self.server.port));

        lines.join("\n")
    }
}

fn push_secret(lines: &mut Vec<String>, name: &str, value: Option<&str>) {
    if let Some(key) = value {
        lines.push(format!("  {name} = \"{}\"", redact(key)));
    }
}

fn push_opt(lines: &mut Vec<String>, name: &str, value: Option<&str>) {
    if let Some(v) = value {
        lines.push(format!("  {name} = \"{v}\""));
    }
}

fn redact(key: &str) -> String {
    if key.len() > 8 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "****".to_string()
    }
}

/// Resolve a credential through the chain: CLI flag > env var > config key > config command.
pub fn resolve_credential(
    cli_flag: Option<&str>,
    env_var_name: &str,
    config_key: Option<&str>,
    config_command: Option<&str>,
) -> Result<String> {
    // 1. CLI flag
    if let Some(key) = cli_flag {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    // 2. Environment variable
    if let Ok(val) = std::env::var(env_var_name) {
        if !val.is_empty() {
            return Ok(val);
        }
    }

    // 3. Config file key
    if let Some(key) = config_key {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    // 4. External command
    if let Some(cmd) = config_command {
        if !cmd.is_empty() {
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .with_context(|| format!("Failed to run credential command: {cmd}"))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "credential command failed (exit {}): {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                );
            }

            let secret = String::from_utf8(output.stdout)
                .context("credential command output is not valid UTF-8")?
                .trim()
                .to_string();

            if !secret.is_empty() {
                return Ok(secret);
            }
        }
    }

    bail!(
        "No credential found. Provide via flag, {} env var, or config.toml",
        env_var_name
    );
}

/// Default KB root: ~/.kb
pub fn default_root() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".kb"))
}

/// Path to the config file: <root>/config.toml
pub fn config_path(root: &Path) -> PathBuf {
    root.join("config.toml")
}

/// Default config template content.
pub fn default_config_template() -> &'static str {
    r#"# ~/.kb/config.toml
# Credential resolution order: CLI flag > env var > key > key command

[llm]
# api_key = "sk-ant-..."            # or ANTHROPIC_API_KEY
# api_key_command = "your-secrets-manager-command-here"
# model = "claude-sonnet-4-20250514"
# max_retries = 2

[transcription]
# command = "whisperx"
# model = "large-v3"
# diarize = false
# hf_token_command = "your-secrets-manager-command-here"   # or HF_TOKEN

[daemon]
# record_command = ["rec", "-q", "-c", "1", "-r", "16000", "{output}"]
# model = "base.en"
# paste = true
# archive = false

[server]
# port = 5111
"#
}

/// Create the default config file if it doesn't already exist.
pub fn init_config(root: &Path) -> Result<bool> {
    let path = config_path(root);
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, default_config_template())?;
    Ok(true)
}
