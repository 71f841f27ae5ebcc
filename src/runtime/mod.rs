//! Agent runtimes: how an agent process gets started and torn down.

pub mod docker;
pub mod env;
pub mod executable;
pub mod logger;
pub mod remote;

pub use docker::DockerRuntime;
pub use env::EnvVar;
pub use executable::ExecutableRuntime;
pub use remote::RemoteRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::bus::EventBus;
use crate::orchestrator::registry::ConfigValue;
use crate::Result;
use logger::LogSink;

/// Default time a process gets to exit after SIGTERM
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(30);

/// How an agent type is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRuntime {
    Executable(ExecutableRuntime),
    Docker(DockerRuntime),
    Remote(RemoteRuntime),
}

impl AgentRuntime {
    /// Value exported as `CORAL_ORCHESTRATION_RUNTIME`
    pub fn name(&self) -> &'static str {
        match self {
            AgentRuntime::Executable(_) => "executable",
            AgentRuntime::Docker(_) => "docker",
            AgentRuntime::Remote(_) => "remote",
        }
    }

    /// Start the agent; its output is published on `bus`
    pub async fn spawn(
        &self,
        params: &RuntimeParams,
        bus: EventBus<RuntimeEvent>,
    ) -> Result<Box<dyn RuntimeHandle>> {
        match self {
            AgentRuntime::Executable(runtime) => {
                let sink = LogSink::new(params, bus)?;
                Ok(Box::new(runtime.spawn(params, sink).await?))
            }
            AgentRuntime::Docker(runtime) => {
                let sink = LogSink::new(params, bus)?;
                Ok(Box::new(runtime.spawn(params, sink).await?))
            }
            AgentRuntime::Remote(runtime) => runtime.spawn(params).await,
        }
    }
}

/// A running agent, owned by the orchestrator
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    fn session_id(&self) -> &str;

    fn agent_name(&self) -> &str;

    /// Stop the agent and release its resources. Calling it again is a no-op.
    async fn destroy(&self) -> Result<()>;
}

/// Everything a runtime needs to launch one agent of a session
#[derive(Debug, Clone)]
pub struct RuntimeParams {
    pub session_id: String,
    pub agent_name: String,
    /// Port of the server the agent connects back to
    pub server_port: u16,
    /// `{app}/{key}/{session}/sse?agentId={name}`
    pub relative_uri: String,
    pub system_prompt: Option<String>,
    /// Resolved options of the agent's registry entry
    pub options: HashMap<String, ConfigValue>,
    /// Directory for per-agent log files, if enabled
    pub agent_log_dir: Option<PathBuf>,
    pub destroy_grace: Duration,
}

impl RuntimeParams {
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        server_port: u16,
        relative_uri: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            server_port,
            relative_uri: relative_uri.into(),
            system_prompt: None,
            options: HashMap::new(),
            agent_log_dir: None,
            destroy_grace: DEFAULT_DESTROY_GRACE,
        }
    }

    /// Absolute URL the agent uses to reach the server through `host`
    pub fn connection_url(&self, host: &str) -> Result<Url> {
        let relative = self.relative_uri.trim_start_matches('/');
        Ok(Url::parse(&format!(
            "http://{}:{}/{}",
            host, self.server_port, relative
        ))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Stdout,
    Stderr,
}

/// Output of a running agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Log {
        /// Milliseconds since the epoch
        timestamp: i64,
        kind: LogKind,
        message: String,
    },
}

impl RuntimeEvent {
    pub fn log(kind: LogKind, message: impl Into<String>) -> Self {
        RuntimeEvent::Log {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            message: message.into(),
        }
    }
}
