use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::KbError;

/// Where the daemon is in its record/transcribe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Recording { audio: PathBuf, since: String },
    Transcribing { audio: PathBuf, since: String },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Recording { .. } => "recording",
            Phase::Transcribing { .. } => "transcribing",
        }
    }
}

/// Side effect the caller must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    StartRecording(PathBuf),
    /// Stop the recorder and hand the file to the worker.
    Transcribe(PathBuf),
    /// Stop the recorder and throw the file away.
    Discard(PathBuf),
    Nothing,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(flatten)]
    pub phase: Phase,
    pub last_text: Option<String>,
    pub last_error: Option<String>,
    pub completed: u64,
}

/// Idle → Recording → Transcribing → Idle. No I/O happens here.
#[derive(Debug, Clone)]
pub struct Machine {
    phase: Phase,
    last_text: Option<String>,
    last_error: Option<String>,
    completed: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_text: None,
            last_error: None,
            completed: 0,
        }
    }
}

impl Machine {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Start recording when idle, stop and transcribe when recording.
    /// Rejected while a transcription is running.
    pub fn toggle(&mut self, next_audio: PathBuf, now: &str) -> Result<Step, KbError> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                self.phase = Phase::Recording {
                    audio: next_audio.clone(),
                    since: now.to_string(),
                };
                Ok(Step::StartRecording(next_audio))
            }
            Phase::Recording { audio, .. } => {
                self.phase = Phase::Transcribing {
                    audio: audio.clone(),
                    since: now.to_string(),
                };
                Ok(Step::Transcribe(audio))
            }
            busy @ Phase::Transcribing { .. } => {
                self.phase = busy;
                Err(KbError::Busy)
            }
        }
    }

    /// Abandon a recording in progress. A running transcription is left alone.
    pub fn cancel(&mut self) -> Step {
        match &self.phase {
            Phase::Recording { audio, .. } => {
                let audio = audio.clone();
                self.phase = Phase::Idle;
                Step::Discard(audio)
            }
            _ => Step::Nothing,
        }
    }

    /// The worker is done. Only meaningful while transcribing.
    pub fn finish(&mut self, result: Result<String, String>) {
        if !matches!(self.phase, Phase::Transcribing { .. }) {
            return;
        }
        self.phase = Phase::Idle;
        match result {
            Ok(text) => {
                self.last_text = Some(text);
                self.last_error = None;
                self.completed += 1;
            }
            Err(e) => self.last_error = Some(e),
        }
    }

    /// Any side effect failed: back to idle with the error kept.
    pub fn fail(&mut self, error: String) {
        self.phase = Phase::Idle;
        self.last_error = Some(error);
    }

    pub fn status(&self) -> Status {
        Status {
            phase: self.phase.clone(),
            last_text: self.last_text.clone(),
            last_error: self.last_error.clone(),
            completed: self.completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(n: u32) -> PathBuf {
        PathBuf::from(format!("/tmp/rec-{n}.wav"))
    }

    #[test]
    fn full_cycle() {
        let mut m = Machine::default();
        assert_eq!(m.toggle(wav(1), "t0").unwrap(), Step::StartRecording(wav(1)));
        assert_eq!(m.phase().name(), "recording");
        assert_eq!(m.toggle(wav(2), "t1").unwrap(), Step::Transcribe(wav(1)));
        assert_eq!(m.phase().name(), "transcribing");

        m.finish(Ok("hello".into()));
        let s = m.status();
        assert_eq!(s.phase, Phase::Idle);
        assert_eq!(s.last_text.as_deref(), Some("hello"));
        assert_eq!(s.completed, 1);
    }

    #[test]
    fn toggle_while_transcribing_is_busy() {
        let mut m = Machine::default();
        m.toggle(wav(1), "t0").unwrap();
        m.toggle(wav(2), "t1").unwrap();
        assert!(matches!(m.toggle(wav(3), "t2"), Err(KbError::Busy)));
        assert_eq!(m.phase().name(), "transcribing");
    }

    #[test]
    fn cancel_only_affects_recording() {
        let mut m = Machine::default();
        assert_eq!(m.cancel(), Step::Nothing);
        m.toggle(wav(1), "t0").unwrap();
        assert_eq!(m.cancel(), Step::Discard(wav(1)));
        assert_eq!(*m.phase(), Phase::Idle);

        m.toggle(wav(2), "t1").unwrap();
        m.toggle(wav(3), "t2").unwrap();
        assert_eq!(m.cancel(), Step::Nothing);
        assert_eq!(m.phase().name(), "transcribing");
    }

    #[test]
    fn errors_return_to_idle() {
        let mut m = Machine::default();
        m.toggle(wav(1), "t0").unwrap();
        m.toggle(wav(2), "t1").unwrap();
        m.finish(Err("recognizer crashed".into()));
        let s = m.status();
        assert_eq!(s.phase, Phase::Idle);
        assert_eq!(s.last_error.as_deref(), Some("recognizer crashed"));
        assert_eq!(s.completed, 0);

        m.toggle(wav(3), "t2").unwrap();
        m.fail("rec not installed".into());
        assert_eq!(*m.phase(), Phase::Idle);
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let mut m = Machine::default();
        m.toggle(wav(1), "t0").unwrap();
        let v = serde_json::to_value(m.status()).unwrap();
        assert_eq!(v["state"], "recording");
        assert_eq!(v["audio"], "/tmp/rec-1.wav");
        let back: Status = serde_json::from_value(v).unwrap();
        assert_eq!(back, m.status());
    }
}
