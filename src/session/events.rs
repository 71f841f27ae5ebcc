//! Session events streamed to debug observers

use serde::{Deserialize, Serialize};

use super::model::{Agent, Message};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    AgentRegistered {
        agent: Agent,
    },

    ThreadCreated {
        id: String,
        name: String,
        creator_id: String,
        participants: Vec<String>,
        summary: Option<String>,
    },

    ParticipantAdded {
        thread_id: String,
        agent_id: String,
    },

    ParticipantRemoved {
        thread_id: String,
        agent_id: String,
    },

    ThreadClosed {
        thread_id: String,
        summary: String,
    },

    MessageSent {
        thread_id: String,
        message: Message,
    },
}
