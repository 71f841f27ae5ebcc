//! Agents launched as Docker containers

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::env::{self, EnvVar};
use super::logger::LogSink;
use super::{LogKind, RuntimeHandle, RuntimeParams};
use crate::{CoralError, Result};

/// Host name containers use to reach the server
const CONTAINER_HOST: &str = "host.docker.internal";

/// Seconds Docker waits after SIGTERM before killing on stop
const STOP_TIMEOUT_SECS: i64 = 10;

/// Bound on a normal remove before falling back to a forced one
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_NAME_LEN: usize = 63;
const NAME_PREFIX_LEN: usize = 52;
const NAME_HASH_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerRuntime {
    pub image: String,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

impl DockerRuntime {
    pub async fn spawn(&self, params: &RuntimeParams, sink: LogSink) -> Result<DockerHandle> {
        info!("Spawning Docker container with image: {}", self.image);
        let docker = connect()?;

        let url = params.connection_url(CONTAINER_HOST)?;
        let environment: Vec<String> =
            env::build_environment(&self.environment, params, &url, "docker")?
                .into_iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();

        let name = container_name(&params.relative_uri, &params.agent_name);
        let config = Config {
            image: Some(self.image.clone()),
            env: Some(environment),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(false),
            tty: Some(false),
            host_config: Some(HostConfig {
                extra_hosts: Some(vec![format!("{}:host-gateway", CONTAINER_HOST)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| CoralError::Spawn(format!("create container {}: {}", name, e)))?;

        let attached = discard_on_failure(
            &docker,
            &created.id,
            &name,
            start_and_attach(&docker, &created.id, &name).await,
        )
        .await?;

        let drain = tokio::spawn(drain_output(attached.output, sink));
        info!("Container {} ({}) started for {}", name, created.id, params.agent_name);

        Ok(DockerHandle {
            docker,
            container_id: created.id,
            container_name: name,
            session_id: params.session_id.clone(),
            agent_name: params.agent_name.clone(),
            destroyed: AtomicBool::new(false),
            drain: parking_lot::Mutex::new(Some(drain)),
        })
    }
}

async fn start_and_attach(
    docker: &Docker,
    container_id: &str,
    name: &str,
) -> Result<AttachContainerResults> {
    docker
        .start_container(container_id, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| CoralError::Spawn(format!("start container {}: {}", name, e)))?;

    docker
        .attach_container(
            container_id,
            Some(AttachContainerOptions::<String> {
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| CoralError::Spawn(format!("attach to container {}: {}", name, e)))
}

/// Force-remove a created container whose startup failed; the startup error
/// is returned regardless of how the removal went.
async fn discard_on_failure<T>(
    docker: &Docker,
    container_id: &str,
    name: &str,
    result: Result<T>,
) -> Result<T> {
    if result.is_err() {
        let removed = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => info!("Removed container {} after failed startup", name),
            Err(e) if is_state_conflict(&e) => {}
            Err(e) => warn!("Failed to remove container {} after failed startup: {}", name, e),
        }
    }
    result
}

/// Connect using `CORAL_DOCKER_SOCKET`, then colima's socket, then defaults
fn connect() -> Result<Docker> {
    #[cfg(unix)]
    {
        if let Ok(socket) = std::env::var("CORAL_DOCKER_SOCKET") {
            let path = socket.trim_start_matches("unix://");
            debug!("Connecting to Docker at {}", path);
            return Ok(Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?);
        }
        if let Some(home) = dirs::home_dir() {
            let colima = home.join(".colima").join("default").join("docker.sock");
            if colima.exists() {
                debug!("Connecting to colima Docker at {:?}", colima);
                return Ok(Docker::connect_with_unix(
                    &colima.to_string_lossy(),
                    120,
                    bollard::API_DEFAULT_VERSION,
                )?);
            }
        }
    }
    Ok(Docker::connect_with_local_defaults()?)
}

/// Deterministic container name for an agent of a session
pub fn container_name(relative_uri: &str, agent_name: &str) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, relative_uri.as_bytes())
        .simple()
        .to_string();
    let prefix: String = agent_name.chars().take(NAME_PREFIX_LEN).collect();
    let raw = format!("{}_{}", prefix, &digest[..NAME_HASH_LEN]);

    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_NAME_LEN)
        .collect();
    sanitized.trim_matches('_').to_string()
}

/// Republish attached container output as lines
async fn drain_output<S>(mut output: S, sink: LogSink)
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();

    while let Some(frame) = output.next().await {
        match frame {
            Ok(LogOutput::StdErr { message }) => stderr.push(&message, LogKind::Stderr, &sink),
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                stdout.push(&message, LogKind::Stdout, &sink)
            }
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                debug!("Output stream of {} ended: {}", sink.agent_name(), e);
                break;
            }
        }
    }

    stdout.flush(LogKind::Stdout, &sink);
    stderr.flush(LogKind::Stderr, &sink);
}

/// Frames are not line-aligned; hold partial lines until completed
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8], kind: LogKind, sink: &LogSink) {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            sink.emit(kind, line.trim_end_matches(['\n', '\r']).to_string());
        }
    }

    fn flush(&mut self, kind: LogKind, sink: &LogSink) {
        if !self.pending.is_empty() {
            sink.emit(kind, std::mem::take(&mut self.pending));
        }
    }
}

pub struct DockerHandle {
    docker: Docker,
    container_id: String,
    container_name: String,
    session_id: String,
    agent_name: String,
    destroyed: AtomicBool,
    drain: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DockerHandle {
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn remove(&self, force: bool) -> std::result::Result<(), bollard::errors::Error> {
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    force,
                    ..Default::default()
                }),
            )
            .await
    }
}

#[async_trait]
impl RuntimeHandle for DockerHandle {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stopped = self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await;
        if let Err(e) = stopped {
            if !is_state_conflict(&e) {
                warn!("Failed to stop container {}: {}", self.container_name, e);
            }
        }

        let removed = match tokio::time::timeout(REMOVE_TIMEOUT, self.remove(false)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Container {} was not removed within {:?}, forcing",
                    self.container_name, REMOVE_TIMEOUT
                );
                self.remove(true).await
            }
        };
        let removed = match removed {
            Err(e) if !is_state_conflict(&e) => {
                warn!("Removing container {} failed ({}), forcing", self.container_name, e);
                self.remove(true).await
            }
            other => other,
        };
        match removed {
            Err(e) if !is_state_conflict(&e) => {
                return Err(CoralError::Teardown(format!(
                    "container {}: {}",
                    self.container_name, e
                )));
            }
            _ => {}
        }

        let drain = self.drain.lock().take();
        if let Some(mut drain) = drain {
            if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut drain).await.is_err() {
                drain.abort();
            }
        }

        info!("Docker container {} stopped and removed", self.agent_name);
        Ok(())
    }
}

/// Docker's "not modified" and "no such container" mean the work is done
fn is_state_conflict(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }
    )
}
