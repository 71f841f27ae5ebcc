//! Agents launched as local processes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::env::{self, EnvVar};
use super::logger::LogSink;
use super::{LogKind, RuntimeHandle, RuntimeParams};
use crate::{CoralError, Result};

/// Time descendants get between SIGTERM and SIGKILL
const DESCENDANT_GRACE: Duration = Duration::from_secs(1);

/// Bound on waiting for output drains once the process is gone
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableRuntime {
    /// Program followed by its arguments
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

impl ExecutableRuntime {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            environment: Vec::new(),
        }
    }

    pub fn with_env(mut self, var: EnvVar) -> Self {
        self.environment.push(var);
        self
    }

    pub async fn spawn(&self, params: &RuntimeParams, sink: LogSink) -> Result<ExecutableHandle> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            CoralError::InvalidArgument("executable runtime has an empty command".to_string())
        })?;

        let url = params.connection_url("localhost")?;
        let environment = env::build_environment(&self.environment, params, &url, "executable")?;

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Spawning process for {}: {}", params.agent_name, self.command.join(" "));
        let mut child = cmd
            .spawn()
            .map_err(|e| CoralError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child.id();

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain_lines(stdout, LogKind::Stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain_lines(stderr, LogKind::Stderr, sink)));
        }

        Ok(ExecutableHandle {
            session_id: params.session_id.clone(),
            agent_name: params.agent_name.clone(),
            pid,
            grace: params.destroy_grace,
            child: tokio::sync::Mutex::new(Some(child)),
            drains: parking_lot::Mutex::new(drains),
        })
    }
}

/// Forward each line of `stream` until it closes
async fn drain_lines<R>(stream: R, kind: LogKind, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.emit(kind, line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{:?} of {} closed: {}", kind, sink.agent_name(), e);
                break;
            }
        }
    }
}

pub struct ExecutableHandle {
    session_id: String,
    agent_name: String,
    pid: Option<u32>,
    grace: Duration,
    /// Taken by the first destroy
    child: tokio::sync::Mutex<Option<Child>>,
    drains: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutableHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn stop_descendants(&self, pid: u32) {
        let descendants = process_tree::descendants(pid);
        if descendants.is_empty() {
            return;
        }
        info!(
            "Stopping {} descendant process(es) of {}",
            descendants.len(),
            self.agent_name
        );
        for child in &descendants {
            process_tree::terminate(*child);
        }
        tokio::time::sleep(DESCENDANT_GRACE).await;
        for child in &descendants {
            if process_tree::is_alive(*child) {
                debug!("Descendant {} ignored SIGTERM, killing", child);
                process_tree::kill(*child);
            }
        }
    }

    /// Signal the process tree and reap the process
    async fn stop(&self, child: &mut Child) -> Result<()> {
        if let Some(pid) = self.pid {
            self.stop_descendants(pid).await;
        }

        let signalled = self.pid.is_some_and(process_tree::terminate);
        if !signalled {
            if let Err(e) = child.start_kill() {
                warn!("[{}] Failed to signal process: {}", self.agent_name, e);
                return Err(CoralError::Teardown(format!("{}: {}", self.agent_name, e)));
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => info!("[{}] Process exited ({})", self.agent_name, status),
            Ok(Err(e)) => warn!("[{}] Failed to reap process: {}", self.agent_name, e),
            Err(_) => {
                warn!(
                    "[{}] Process still running after {:?}, killing",
                    self.agent_name, self.grace
                );
                if let Err(e) = child.kill().await {
                    warn!("[{}] Failed to kill process: {}", self.agent_name, e);
                    return Err(CoralError::Teardown(format!("{}: {}", self.agent_name, e)));
                }
            }
        }
        Ok(())
    }

    async fn join_drains(&self) {
        let drains: Vec<JoinHandle<()>> = std::mem::take(&mut *self.drains.lock());
        for mut drain in drains {
            if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut drain).await.is_err() {
                debug!("Output drain for {} did not finish, aborting", self.agent_name);
                drain.abort();
            }
        }
    }
}

#[async_trait]
impl RuntimeHandle for ExecutableHandle {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn destroy(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let outcome = match child.try_wait() {
            Ok(Some(status)) => {
                info!("[{}] Process already exited ({})", self.agent_name, status);
                Ok(())
            }
            _ => self.stop(&mut child).await,
        };

        // Output must be drained even when the process could not be killed
        self.join_drains().await;
        outcome
    }
}

#[cfg(unix)]
mod process_tree {
    //! Signals and process-tree walking via /proc, with `pgrep` as fallback

    use std::fs;

    /// All transitive children of `pid`, parents before children
    pub fn descendants(pid: u32) -> Vec<u32> {
        let mut found = Vec::new();
        let mut stack = vec![pid];
        while let Some(parent) = stack.pop() {
            for child in children_of(parent) {
                if child != pid && !found.contains(&child) {
                    found.push(child);
                    stack.push(child);
                }
            }
        }
        found
    }

    fn children_of(pid: u32) -> Vec<u32> {
        proc_children(pid).unwrap_or_else(|| pgrep_children(pid))
    }

    fn proc_children(pid: u32) -> Option<Vec<u32>> {
        let tasks = fs::read_dir(format!("/proc/{}/task", pid)).ok()?;
        let mut children = Vec::new();
        for task in tasks.flatten() {
            let listed = fs::read_to_string(task.path().join("children")).ok()?;
            children.extend(listed.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
        }
        Some(children)
    }

    fn pgrep_children(pid: u32) -> Vec<u32> {
        std::process::Command::new("pgrep")
            .arg("-P")
            .arg(pid.to_string())
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .split_whitespace()
                    .filter_map(|p| p.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn signal(pid: u32, sig: libc::c_int) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        unsafe { libc::kill(pid, sig) == 0 }
    }

    pub fn terminate(pid: u32) -> bool {
        signal(pid, libc::SIGTERM)
    }

    pub fn kill(pid: u32) -> bool {
        signal(pid, libc::SIGKILL)
    }

    /// Zombies awaiting their reaper count as gone
    pub fn is_alive(pid: u32) -> bool {
        signal(pid, 0) && !is_zombie(pid)
    }

    fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // State follows the parenthesised command name, which may itself contain spaces
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z")
    }
}

#[cfg(not(unix))]
mod process_tree {
    pub fn descendants(_pid: u32) -> Vec<u32> {
        Vec::new()
    }

    pub fn terminate(_pid: u32) -> bool {
        false
    }

    pub fn kill(_pid: u32) -> bool {
        false
    }

    pub fn is_alive(_pid: u32) -> bool {
        false
    }
}
