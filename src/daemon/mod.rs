//! Dictation daemon: record on toggle, transcribe on a worker thread, then
//! copy/paste the text. Controlled over `<root>/daemon.sock`.

pub mod clipboard;
pub mod control;
pub mod recorder;
pub mod state;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::kb::Kb;
use crate::store::KbPaths;
use crate::store::models::SourceKind;
use crate::transcribe::{transcript_from, CommandTranscriber, RecognizeOptions, Transcriber};
use clipboard::Paster;
use control::{ControlCommand, Reply};
use recorder::{CommandRecorder, Recorder};
use state::{Machine, Step};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything the worker needs to turn a recording into text.
pub struct Pipeline {
    pub transcriber: Arc<dyn Transcriber>,
    pub options: RecognizeOptions,
    pub paster: Paster,
    /// Store each dictation as a transcript when set.
    pub archive: Option<Arc<Kb>>,
    pub keep_audio: bool,
}

impl Pipeline {
    fn process(&self, audio: &Path) -> Result<String> {
        let recognized = self.transcriber.transcribe(audio, &self.options)?;
        let text = recognized.text.trim().to_string();
        self.paster.deliver(&text)?;

        if let Some(kb) = &self.archive {
            if !text.is_empty() {
                let mut t = transcript_from(audio, recognized, SourceKind::Daemon, &self.options.model);
                t.source_path = Some(audio.display().to_string());
                kb.add_transcript(&mut t)?;
            }
        }
        Ok(text)
    }
}

/// Owns the state machine, the recorder and the worker thread.
pub struct Daemon {
    machine: Arc<Mutex<Machine>>,
    recorder: Mutex<Box<dyn Recorder>>,
    jobs: Option<Sender<PathBuf>>,
    worker: Option<JoinHandle<()>>,
    recordings_dir: PathBuf,
    keep_audio: bool,
}

impl Daemon {
    pub fn new(recorder: Box<dyn Recorder>, pipeline: Pipeline, recordings_dir: PathBuf) -> Self {
        let machine = Arc::new(Mutex::new(Machine::default()));
        let keep_audio = pipeline.keep_audio;
        let (tx, rx) = mpsc::channel();
        let worker = {
            let machine = Arc::clone(&machine);
            std::thread::spawn(move || worker_loop(rx, pipeline, machine))
        };
        Self {
            machine,
            recorder: Mutex::new(recorder),
            jobs: Some(tx),
            worker: Some(worker),
            recordings_dir,
            keep_audio,
        }
    }

    fn next_audio_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        self.recordings_dir.join(format!("dictation-{stamp}.wav"))
    }

    /// Handle one control line. The flag asks the caller to shut down.
    pub fn handle(&self, line: &str) -> (Reply, bool) {
        let Some(cmd) = ControlCommand::from_str(line) else {
            return (self.reply(false, format!("unknown command: {}", line.trim())), false);
        };

        match cmd {
            ControlCommand::Toggle => (self.toggle(), false),
            ControlCommand::Cancel => (self.cancel(), false),
            ControlCommand::Status => (self.reply(true, String::new()), false),
            ControlCommand::Shutdown => {
                self.cancel();
                (self.reply(true, "shutting down".into()), true)
            }
        }
    }

    fn reply(&self, ok: bool, message: String) -> Reply {
        Reply {
            ok,
            message,
            status: lock(&self.machine).status(),
        }
    }

    fn toggle(&self) -> Reply {
        let now = chrono::Utc::now().to_rfc3339();
        let mut machine = lock(&self.machine);
        let step = match machine.toggle(self.next_audio_path(), &now) {
            Ok(step) => step,
            Err(e) => {
                drop(machine);
                return self.reply(false, e.to_string());
            }
        };

        let mut recorder = lock(&self.recorder);
        let outcome = match &step {
            Step::StartRecording(path) => recorder.start(path).map(|_| "recording"),
            Step::Transcribe(path) => recorder.stop().and_then(|_| {
                self.jobs
                    .as_ref()
                    .context("Worker has stopped")?
                    .send(path.clone())
                    .context("Worker has stopped")?;
                Ok("transcribing")
            }),
            Step::Discard(_) | Step::Nothing => Ok("unchanged"),
        };
        drop(recorder);

        match outcome {
            Ok(msg) => {
                info!("Toggle: {msg}");
                drop(machine);
                self.reply(true, msg.to_string())
            }
            Err(e) => {
                error!("Toggle failed: {e:#}");
                machine.fail(format!("{e:#}"));
                drop(machine);
                self.reply(false, format!("{e:#}"))
            }
        }
    }

    fn cancel(&self) -> Reply {
        let step = lock(&self.machine).cancel();
        match step {
            Step::Discard(path) => {
                lock(&self.recorder).abort();
                let _ = std::fs::remove_file(&path);
                info!("Recording cancelled");
                self.reply(true, "cancelled".into())
            }
            _ => self.reply(true, "nothing to cancel".into()),
        }
    }

    pub fn status(&self) -> state::Status {
        lock(&self.machine).status()
    }

    /// Stop the worker after it finishes any queued job.
    pub fn shutdown(mut self) {
        lock(&self.recorder).abort();
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        if !self.keep_audio {
            let _ = std::fs::remove_dir(&self.recordings_dir);
        }
    }
}

fn worker_loop(rx: Receiver<PathBuf>, pipeline: Pipeline, machine: Arc<Mutex<Machine>>) {
    for audio in rx {
        let started = Instant::now();
        let result = pipeline.process(&audio);
        match &result {
            Ok(text) => info!(
                words = text.split_whitespace().count(),
                secs = started.elapsed().as_secs_f32(),
                "Transcribed {}",
                audio.display()
            ),
            Err(e) => error!("Transcription failed: {e:#}"),
        }
        if !pipeline.keep_audio {
            let _ = std::fs::remove_file(&audio);
        }
        lock(&machine).finish(result.map_err(|e| format!("{e:#}")));
    }
}

/// Run the daemon in the foreground until a `shutdown` command arrives.
pub fn run(kb: Kb) -> Result<()> {
    let socket = kb.paths.daemon_socket();
    let listener = control::bind(&socket)?;
    let pid_file = kb.paths.daemon_pid();
    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("Failed to write {}", pid_file.display()))?;

    let cfg = kb.config.daemon.clone();
    let transcriber = CommandTranscriber::from_config(&kb.config.transcription)?;
    let options = RecognizeOptions {
        model: cfg.model.clone(),
        language: kb.config.transcription.language.clone(),
        hf_token: None,
    };
    let recordings_dir = kb.paths.recordings_dir();
    let kb = Arc::new(kb);
    let pipeline = Pipeline {
        transcriber: Arc::new(transcriber),
        options,
        paster: Paster::from_config(&cfg),
        archive: cfg.archive.then(|| Arc::clone(&kb)),
        keep_audio: cfg.archive,
    };

    let daemon = Daemon::new(
        Box::new(CommandRecorder::new(cfg.record_command.clone())),
        pipeline,
        recordings_dir,
    );
    info!("Daemon listening on {}", socket.display());

    let served = control::serve(&listener, |line| daemon.handle(line));
    daemon.shutdown();
    let _ = std::fs::remove_file(&socket);
    let _ = std::fs::remove_file(&pid_file);
    info!("Daemon stopped");
    served
}

/// Spawn `kb daemon run` in the background and wait for its socket.
pub fn start(root: &Path) -> Result<u32> {
    let paths = KbPaths::new(root);
    let socket = paths.daemon_socket();
    if control::send(&socket, ControlCommand::Status).is_ok() {
        bail!("Daemon already running");
    }

    let exe = std::env::current_exe().context("Cannot locate the kb executable")?;
    let child = std::process::Command::new(exe)
        .arg("--root")
        .arg(root)
        .args(["daemon", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to spawn daemon")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if control::send(&socket, ControlCommand::Status).is_ok() {
            return Ok(child.id());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("Daemon did not come up; see {}", paths.log_dir().display())
}

/// Ask the daemon to stop, falling back to SIGTERM on the recorded pid.
pub fn stop(root: &Path) -> Result<()> {
    let paths = KbPaths::new(root);
    let socket = paths.daemon_socket();
    if control::send(&socket, ControlCommand::Shutdown).is_ok() {
        return Ok(());
    }

    let pid_file = paths.daemon_pid();
    let pid: i32 = std::fs::read_to_string(&pid_file)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .context("Daemon is not running")?;
    // SAFETY: kill(2) with a pid read from our own pid file.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    let _ = std::fs::remove_file(&pid_file);
    let _ = std::fs::remove_file(&socket);
    if rc != 0 {
        bail!("Daemon is not running (stale pid {pid})");
    }
    Ok(())
}

/// Log to `<root>/logs/daemon.log.<date>`. Keep the guard alive for the
/// life of the process.
pub fn init_file_logging(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    let appender = tracing_appender::rolling::daily(log_dir, "daemon.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::json::RecognizedText;
    use state::Phase;

    struct FakeRecorder;

    impl Recorder for FakeRecorder {
        fn start(&mut self, output: &Path) -> Result<()> {
            std::fs::create_dir_all(output.parent().unwrap())?;
            std::fs::write(output, b"RIFF")?;
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn abort(&mut self) {}
    }

    struct BrokenRecorder;

    impl Recorder for BrokenRecorder {
        fn start(&mut self, _output: &Path) -> Result<()> {
            bail!("no microphone")
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn abort(&mut self) {}
    }

    struct SlowTranscriber {
        text: &'static str,
    }

    impl Transcriber for SlowTranscriber {
        fn transcribe(&self, _audio: &Path, _opts: &RecognizeOptions) -> Result<RecognizedText> {
            std::thread::sleep(Duration::from_millis(100));
            if self.text.is_empty() {
                bail!("recognizer crashed");
            }
            Ok(RecognizedText {
                text: self.text.into(),
                ..Default::default()
            })
        }
    }

    fn daemon(dir: &Path, recorder: Box<dyn Recorder>, text: &'static str, archive: Option<Arc<Kb>>) -> Daemon {
        let clip = dir.join("clip.txt");
        let pipeline = Pipeline {
            transcriber: Arc::new(SlowTranscriber { text }),
            options: RecognizeOptions {
                model: "base.en".into(),
                language: "en".into(),
                hf_token: None,
            },
            paster: Paster {
                copy_command: vec!["sh".into(), "-c".into(), format!("cat > {}", clip.display())],
                paste_command: None,
            },
            keep_audio: archive.is_some(),
            archive,
        };
        Daemon::new(recorder, pipeline, dir.join("recordings"))
    }

    fn wait_idle(d: &Daemon) -> state::Status {
        let t0 = Instant::now();
        loop {
            let s = d.status();
            if s.phase == Phase::Idle || t0.elapsed() > Duration::from_secs(5) {
                return s;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn toggle_records_then_transcribes_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(dir.path(), Box::new(FakeRecorder), "hello world", None);

        let (reply, stop) = d.handle("toggle");
        assert!(reply.ok && !stop);
        assert_eq!(reply.status.phase.name(), "recording");

        let (reply, _) = d.handle("toggle");
        assert_eq!(reply.message, "transcribing");

        let (busy, _) = d.handle("toggle");
        assert!(!busy.ok);

        let s = wait_idle(&d);
        assert_eq!(s.last_text.as_deref(), Some("hello world"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("clip.txt")).unwrap(),
            "hello world"
        );
        d.shutdown();
    }

    #[test]
    fn recorder_failure_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(dir.path(), Box::new(BrokenRecorder), "x", None);
        let (reply, _) = d.handle("toggle");
        assert!(!reply.ok);
        assert_eq!(reply.status.phase, Phase::Idle);
        assert!(reply.status.last_error.unwrap().contains("no microphone"));
        d.shutdown();
    }

    #[test]
    fn transcription_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(dir.path(), Box::new(FakeRecorder), "", None);
        d.handle("toggle");
        d.handle("toggle");
        let s = wait_idle(&d);
        assert!(s.last_error.unwrap().contains("recognizer crashed"));
        d.shutdown();
    }

    #[test]
    fn cancel_and_shutdown_commands() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(dir.path(), Box::new(FakeRecorder), "x", None);
        d.handle("toggle");
        let (reply, _) = d.handle("cancel");
        assert_eq!(reply.message, "cancelled");
        assert_eq!(reply.status.phase, Phase::Idle);

        let (reply, _) = d.handle("bogus");
        assert!(!reply.ok);

        let (_, stop) = d.handle("shutdown");
        assert!(stop);
        d.shutdown();
    }

    #[test]
    fn archives_dictations_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Arc::new(Kb::open(dir.path().join("kb")).unwrap());
        let d = daemon(dir.path(), Box::new(FakeRecorder), "note to self", Some(Arc::clone(&kb)));
        d.handle("toggle");
        d.handle("toggle");
        wait_idle(&d);
        d.shutdown();

        let all = kb.store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source_kind, SourceKind::Daemon);
        assert_eq!(all[0].text, "note to self");
    }
}
