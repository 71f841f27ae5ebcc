//! Agent output logging
//!
//! Every line an agent prints goes to three places: its runtime event bus,
//! the operator log (with ANSI escapes stripped), and optionally a per-agent
//! file under the configured log directory.
//!
//! Default location: `~/.coral/logs/{session-id}-{agent}.log`

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{LogKind, RuntimeEvent, RuntimeParams};
use crate::bus::EventBus;
use crate::{CoralError, Result};

/// Directory name for logs within ~/.coral/
const LOGS_DIR: &str = "logs";

/// Get the path to the default agent logs directory
///
/// Returns `~/.coral/logs/`, creating it if necessary.
pub fn logs_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        CoralError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        ))
    })?;

    let logs_path = home.join(".coral").join(LOGS_DIR);
    fs::create_dir_all(&logs_path)?;
    Ok(logs_path)
}

/// Log file path for one agent of a session
pub fn log_path_for_agent(dir: &Path, session_id: &str, agent_name: &str) -> PathBuf {
    dir.join(format!("{}-{}.log", session_id, agent_name))
}

/// Append-only log file for a single agent
pub struct AgentLogFile {
    file: File,
    path: PathBuf,
    bytes_written: usize,
}

impl AgentLogFile {
    /// Opens in append mode so a respawned agent keeps its earlier output
    pub fn open(dir: &Path, session_id: &str, agent_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = log_path_for_agent(dir, session_id, agent_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        debug!("Agent log for {} opened at {:?}", agent_name, path);

        Ok(Self {
            file,
            path,
            bytes_written: 0,
        })
    }

    pub fn write_line(&mut self, kind: LogKind, line: &str) -> Result<()> {
        let tag = match kind {
            LogKind::Stdout => "out",
            LogKind::Stderr => "err",
        };
        let entry = format!("{} [{}] {}\n", chrono::Utc::now().to_rfc3339(), tag, line);
        self.file.write_all(entry.as_bytes())?;
        self.bytes_written += entry.len();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Drop for AgentLogFile {
    fn drop(&mut self) {
        let _ = self.file.flush();
        debug!(
            "Agent log {:?} closed ({} bytes written)",
            self.path, self.bytes_written
        );
    }
}

/// Fan-out target for one agent's output lines
#[derive(Clone)]
pub struct LogSink {
    session_id: Arc<str>,
    agent_name: Arc<str>,
    bus: EventBus<RuntimeEvent>,
    file: Option<Arc<Mutex<AgentLogFile>>>,
}

impl LogSink {
    pub fn new(params: &RuntimeParams, bus: EventBus<RuntimeEvent>) -> Result<Self> {
        let file = match &params.agent_log_dir {
            Some(dir) => Some(Arc::new(Mutex::new(AgentLogFile::open(
                dir,
                &params.session_id,
                &params.agent_name,
            )?))),
            None => None,
        };
        Ok(Self {
            session_id: params.session_id.as_str().into(),
            agent_name: params.agent_name.as_str().into(),
            bus,
            file,
        })
    }

    pub fn emit(&self, kind: LogKind, line: String) {
        let plain = strip_ansi_escapes::strip_str(&line);
        match kind {
            LogKind::Stdout => info!(session = %self.session_id, "[{}] {}", self.agent_name, plain),
            LogKind::Stderr => warn!(session = %self.session_id, "[{}] {}", self.agent_name, plain),
        }

        if let Some(file) = &self.file {
            if let Err(e) = file.lock().write_line(kind, &plain) {
                debug!("Failed to write log line for {}: {}", self.agent_name, e);
            }
        }

        self.bus.emit(RuntimeEvent::log(kind, line));
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }
}
