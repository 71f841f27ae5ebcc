//! Agents hosted by another server

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{RuntimeHandle, RuntimeParams};
use crate::{CoralError, Result};

/// Where to reach a remote agent and how to authenticate with its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRuntime {
    pub host: String,
    pub agent_type: String,
    pub app_id: String,
    pub privacy_key: String,
}

impl RemoteRuntime {
    // TODO: hand the session off to `host` once server-to-server claiming exists
    pub async fn spawn(&self, params: &RuntimeParams) -> Result<Box<dyn RuntimeHandle>> {
        warn!(
            "Remote agent {} requested on {} but remote spawning is unavailable",
            params.agent_name, self.host
        );
        Err(CoralError::NotImplemented(format!(
            "remote runtime for '{}' on {}",
            self.agent_type, self.host
        )))
    }
}
