use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

use crate::config::DaemonConfig;

/// Puts dictated text on the clipboard and optionally pastes it.
#[derive(Debug, Clone)]
pub struct Paster {
    pub copy_command: Vec<String>,
    pub paste_command: Option<Vec<String>>,
}

impl Paster {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            copy_command: cfg.copy_command.clone(),
            paste_command: cfg.paste.then(|| cfg.paste_command.clone()),
        }
    }

    pub fn deliver(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        run_with_stdin(&self.copy_command, text).context("Failed to copy to clipboard")?;
        if let Some(cmd) = &self.paste_command {
            run_with_stdin(cmd, "").context("Failed to paste")?;
        }
        Ok(())
    }
}

fn run_with_stdin(command: &[String], input: &str) -> Result<()> {
    let (program, args) = command.split_first().context("Empty command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to run {program}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes())?;
    }
    let status = child.wait()?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn copies_through_stdin_and_runs_paste() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.txt");
        let pasted = dir.path().join("pasted");
        let paster = Paster {
            copy_command: vec!["sh".into(), "-c".into(), format!("cat > {}", clip.display())],
            paste_command: Some(vec!["touch".into(), pasted.display().to_string()]),
        };
        paster.deliver("dictated words").unwrap();
        assert_eq!(std::fs::read_to_string(&clip).unwrap(), "dictated words");
        assert!(pasted.exists());
    }

    #[test]
    fn paste_disabled_in_config() {
        let cfg = DaemonConfig {
            paste: false,
            ..Default::default()
        };
        assert!(Paster::from_config(&cfg).paste_command.is_none());
    }

    #[test]
    fn failing_copy_is_an_error() {
        let paster = Paster {
            copy_command: vec!["false".into()],
            paste_command: None,
        };
        assert!(paster.deliver("x").is_err());
    }
}
