use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::transcribe::expand_args;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Recorder: Send {
    fn start(&mut self, output: &Path) -> Result<()>;
    /// Stop and let the recorder finalize the file.
    fn stop(&mut self) -> Result<()>;
    /// Stop without caring about the file.
    fn abort(&mut self);
}

/// Runs a command-line recorder (`rec`, `ffmpeg`, `arecord`...) and stops it
/// with SIGINT so it can write a valid header.
pub struct CommandRecorder {
    command: Vec<String>,
    child: Option<Child>,
}

impl CommandRecorder {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: None,
        }
    }
}

impl Recorder for CommandRecorder {
    fn start(&mut self, output: &Path) -> Result<()> {
        if self.child.is_some() {
            bail!("Recorder already running");
        }
        let out = output.display().to_string();
        let args = expand_args(&self.command, &[("output", out.as_str())]);
        let (program, rest) = args.split_first().context("Empty record_command")?;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start recorder: {program}"))?;
        debug!("Recorder started (pid {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut child = self.child.take().context("Recorder is not running")?;
        interrupt(&child);

        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait()? {
                debug!("Recorder exited: {status}");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Recorder ignored SIGINT, killing it");
                child.kill()?;
                child.wait()?;
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) };
    if rc != 0 {
        warn!("Failed to signal recorder: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}
