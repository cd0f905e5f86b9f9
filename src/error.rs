use thiserror::Error;

/// Domain failures that callers (mostly the dashboard server) need to tell
/// apart. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot {event} an item that is {from}")]
    InvalidTransition { event: String, from: String },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("unknown analysis type: {0}")]
    UnknownAnalysis(String),

    #[error("analysis dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("template error: {0}")]
    Template(String),

    #[error("daemon is busy transcribing")]
    Busy,
}

impl KbError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        KbError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        KbError::Invalid {
            what,
            reason: reason.into(),
        }
    }
}
