//! Environment handed to spawned agents
//!
//! Declared variables come from the registry entry; the `CORAL_*` variables
//! tell the agent how to reach its session and are always set by the server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use super::RuntimeParams;
use crate::orchestrator::registry::ConfigValue;
use crate::{CoralError, Result};

pub const CONNECTION_URL: &str = "CORAL_CONNECTION_URL";
pub const AGENT_ID: &str = "CORAL_AGENT_ID";
pub const SESSION_ID: &str = "CORAL_SESSION_ID";
pub const ORCHESTRATION_RUNTIME: &str = "CORAL_ORCHESTRATION_RUNTIME";
pub const SSE_URL: &str = "CORAL_SSE_URL";
pub const PROMPT_SYSTEM: &str = "CORAL_PROMPT_SYSTEM";

const SYSTEM_VARS: [&str; 6] = [
    CONNECTION_URL,
    AGENT_ID,
    SESSION_ID,
    ORCHESTRATION_RUNTIME,
    SSE_URL,
    PROMPT_SYSTEM,
];

/// A declared environment variable: a literal, or the value of an option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Option to read; defaults to the variable's own name
    #[serde(default)]
    pub option: Option<String>,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            option: None,
        }
    }

    pub fn from_option(name: impl Into<String>, option: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            option: Some(option.into()),
        }
    }

    /// Missing options resolve to an empty value
    pub fn resolve(&self, options: &HashMap<String, ConfigValue>) -> String {
        if let Some(value) = &self.value {
            return value.clone();
        }
        let option = self.option.as_deref().unwrap_or(&self.name);
        options.get(option).map(|v| v.to_string()).unwrap_or_default()
    }
}

/// Declared variables followed by the system ones, ready for the child
pub fn build_environment(
    declared: &[EnvVar],
    params: &RuntimeParams,
    connection_url: &Url,
    runtime_name: &str,
) -> Result<Vec<(String, String)>> {
    let mut env = Vec::with_capacity(declared.len() + SYSTEM_VARS.len());
    for var in declared {
        if SYSTEM_VARS.contains(&var.name.as_str()) {
            return Err(CoralError::InvalidArgument(format!(
                "{} is set by the server and cannot be declared",
                var.name
            )));
        }
        env.push((var.name.clone(), var.resolve(&params.options)));
    }
    env.extend(system_environment(params, connection_url, runtime_name)?);
    Ok(env)
}

fn system_environment(
    params: &RuntimeParams,
    connection_url: &Url,
    runtime_name: &str,
) -> Result<Vec<(String, String)>> {
    let segments: Vec<&str> = connection_url
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let session_id = match segments.as_slice() {
        [.., session, "sse"] => session.to_string(),
        _ => {
            return Err(CoralError::InvalidArgument(format!(
                "connection URL {} must end in /sse",
                connection_url
            )));
        }
    };

    let host = connection_url.host_str().unwrap_or_default();
    let sse_url = match connection_url.port_or_known_default() {
        Some(port) => format!(
            "{}://{}:{}{}",
            connection_url.scheme(),
            host,
            port,
            connection_url.path()
        ),
        None => format!("{}://{}{}", connection_url.scheme(), host, connection_url.path()),
    };

    let mut env = vec![
        (CONNECTION_URL.to_string(), connection_url.to_string()),
        (AGENT_ID.to_string(), params.agent_name.clone()),
        (SESSION_ID.to_string(), session_id),
        (ORCHESTRATION_RUNTIME.to_string(), runtime_name.to_string()),
        (SSE_URL.to_string(), sse_url),
    ];
    if let Some(prompt) = &params.system_prompt {
        env.push((PROMPT_SYSTEM.to_string(), prompt.clone()));
    }
    Ok(env)
}
