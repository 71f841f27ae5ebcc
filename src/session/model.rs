//! Agents, threads and messages

use serde::{Deserialize, Serialize};

/// Reserved sender whose messages reach every participant of a thread
pub const SYSTEM_AGENT_ID: &str = "system";

/// Reserved creator used by the debug collaborator
pub const DEBUG_CREATOR_ID: &str = "debug";

/// An agent connected to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// What the agent is responsible for, shown to its peers
    #[serde(default)]
    pub description: String,
    /// Endpoint the agent connected through, if known
    pub mcp_url: Option<String>,
    /// Tools declared for this agent in the session graph
    #[serde(default)]
    pub extra_tools: Vec<CustomTool>,
}

/// Registration request for an agent joining a session
#[derive(Debug, Clone, Default)]
pub struct AgentRegistration {
    pub id: String,
    pub description: String,
    pub mcp_url: Option<String>,
    /// Overwrite an existing registration (reconnects)
    pub force: bool,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn mcp_url(mut self, url: impl Into<String>) -> Self {
        self.mcp_url = Some(url.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A tool made available to specific agents of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTool {
    pub transport: ToolTransport,
    pub schema: ToolSchema,
}

/// Where calls to a custom tool are forwarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolTransport {
    /// POSTed to `{url}/{session_id}/{agent_id}`
    Http { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// A named, participant-scoped log of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    /// Insertion order, no duplicates, always contains the creator
    pub participants: Vec<String>,
    pub messages: Vec<Message>,
    pub is_closed: bool,
    pub summary: Option<String>,
}

impl Thread {
    pub fn has_participant(&self, agent_id: &str) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }
}

/// A message appended to a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub content: String,
    pub mentions: Vec<String>,
    /// Wall-clock milliseconds since the epoch
    pub timestamp: i64,
    /// Index of this message within its thread
    pub position: usize,
}

impl Message {
    pub fn mentions_agent(&self, agent_id: &str) -> bool {
        self.mentions.iter().any(|m| m == agent_id)
    }

    pub fn is_from_system(&self) -> bool {
        self.sender_id == SYSTEM_AGENT_ID
    }
}
