//! Agent registry: which runtime launches each agent type, and the options
//! an agent of that type accepts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::runtime::AgentRuntime;
use crate::{CoralError, Result};

/// Registry key naming a kind of agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentType(String);

impl AgentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A supplied or defaulted option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Str(String),
    Num(f64),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Str(_) => "string",
            ConfigValue::Num(_) => "number",
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Num(n) => write!(f, "{}", n),
        }
    }
}

/// An option declared by a registry agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigEntry {
    String {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        default: Option<String>,
    },
    Number {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        default: Option<f64>,
    },
}

impl ConfigEntry {
    pub fn name(&self) -> &str {
        match self {
            ConfigEntry::String { name, .. } | ConfigEntry::Number { name, .. } => name,
        }
    }

    /// Options without a default must be supplied by the graph
    pub fn required(&self) -> bool {
        self.default_value().is_none()
    }

    pub fn default_value(&self) -> Option<ConfigValue> {
        match self {
            ConfigEntry::String { default, .. } => default.clone().map(ConfigValue::Str),
            ConfigEntry::Number { default, .. } => default.map(ConfigValue::Num),
        }
    }

    fn accepts(&self, value: &ConfigValue) -> bool {
        matches!(
            (self, value),
            (ConfigEntry::String { .. }, ConfigValue::Str(_))
                | (ConfigEntry::Number { .. }, ConfigValue::Num(_))
        )
    }

    fn type_name(&self) -> &'static str {
        match self {
            ConfigEntry::String { .. } => "string",
            ConfigEntry::Number { .. } => "number",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryAgent {
    pub runtime: AgentRuntime,
    #[serde(default)]
    pub options: Vec<ConfigEntry>,
}

impl RegistryAgent {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self {
            runtime,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, entry: ConfigEntry) -> Self {
        self.options.push(entry);
        self
    }

    /// Check graph-supplied options against the declarations and fill in
    /// defaults for anything omitted.
    pub fn resolve_options(
        &self,
        provided: &HashMap<String, ConfigValue>,
    ) -> Result<HashMap<String, ConfigValue>> {
        if let Some(unknown) = provided
            .keys()
            .find(|key| !self.options.iter().any(|o| o.name() == key.as_str()))
        {
            return Err(CoralError::InvalidArgument(format!(
                "unknown option '{}'",
                unknown
            )));
        }

        let mut resolved = HashMap::with_capacity(self.options.len());
        for entry in &self.options {
            let value = match provided.get(entry.name()) {
                Some(value) if entry.accepts(value) => value.clone(),
                Some(value) => {
                    return Err(CoralError::InvalidArgument(format!(
                        "option '{}' expects a {}, got a {}",
                        entry.name(),
                        entry.type_name(),
                        value.type_name()
                    )));
                }
                None => entry.default_value().ok_or_else(|| {
                    CoralError::InvalidArgument(format!(
                        "missing required option '{}'",
                        entry.name()
                    ))
                })?,
            };
            resolved.insert(entry.name().to_string(), value);
        }
        Ok(resolved)
    }

    fn validate(&self, agent_type: &AgentType) -> Result<()> {
        for (i, entry) in self.options.iter().enumerate() {
            if self.options[..i].iter().any(|o| o.name() == entry.name()) {
                return Err(CoralError::Config(format!(
                    "agent type '{}' declares option '{}' twice",
                    agent_type,
                    entry.name()
                )));
            }
        }
        Ok(())
    }
}

/// Agent types known to this server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRegistry {
    agents: HashMap<AgentType, RegistryAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent_type: impl Into<String>, agent: RegistryAgent) -> Self {
        self.insert(AgentType::new(agent_type), agent);
        self
    }

    pub fn insert(&mut self, agent_type: AgentType, agent: RegistryAgent) {
        self.agents.insert(agent_type, agent);
    }

    pub fn get(&self, agent_type: &AgentType) -> Result<&RegistryAgent> {
        self.agents
            .get(agent_type)
            .ok_or_else(|| CoralError::NotFound(format!("agent type '{}'", agent_type)))
    }

    pub fn agent_types(&self) -> impl Iterator<Item = &AgentType> {
        self.agents.keys()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for (agent_type, agent) in &self.agents {
            agent.validate(agent_type)?;
        }
        Ok(())
    }
}
