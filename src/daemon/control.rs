//! Line-oriented control protocol over the daemon's Unix socket: the client
//! writes one command per line and reads one JSON reply per line.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::state::Status;

/// Socket file permissions (owner read/write only)
const SOCKET_MODE: u32 = 0o600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Toggle,
    Cancel,
    Status,
    Shutdown,
}

impl ControlCommand {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "toggle" => Some(Self::Toggle),
            "cancel" => Some(Self::Cancel),
            "status" => Some(Self::Status),
            "shutdown" | "stop" => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toggle => "toggle",
            Self::Cancel => "cancel",
            Self::Status => "status",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub status: Status,
}

/// Bind the control socket. A stale socket file is replaced; a live one
/// means another daemon owns this root.
pub fn bind(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        if UnixStream::connect(socket).is_ok() {
            bail!("A daemon is already listening on {}", socket.display());
        }
        std::fs::remove_file(socket)
            .with_context(|| format!("Failed to remove stale socket: {}", socket.display()))?;
    }
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("Failed to bind {}", socket.display()))?;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// How long a client gets to deliver its command line.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept connections until `handle` asks to stop. Each connection carries
/// one command line and gets one reply; a client that stays silent past
/// `CLIENT_READ_TIMEOUT` is dropped.
pub fn serve(listener: &UnixListener, mut handle: impl FnMut(&str) -> (Reply, bool)) -> Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("Accept error: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)) {
            warn!("Failed to set client timeout: {e}");
            continue;
        }

        let mut line = String::new();
        match BufReader::new(&stream).read_line(&mut line) {
            Ok(_) => {}
            Err(e) => {
                debug!("Client read error: {e}");
                continue;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let (reply, shutdown) = handle(line.trim_end());
        let mut json = serde_json::to_string(&reply)?;
        json.push('\n');
        if let Err(e) = (&stream).write_all(json.as_bytes()) {
            debug!("Client write error: {e}");
        }
        if shutdown {
            break;
        }
    }
    Ok(())
}

/// Send one command to a running daemon.
pub fn send(socket: &Path, command: ControlCommand) -> Result<Reply> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Daemon is not running (no socket at {})", socket.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(format!("{}\n", command.as_str()).as_bytes())?;

    let mut line = String::new();
    BufReader::new(&stream)
        .read_line(&mut line)
        .context("No reply from daemon")?;
    serde_json::from_str(&line).context("Malformed reply from daemon")
}
