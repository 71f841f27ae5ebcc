//! Agent graphs: which agents a session spawns and how they are linked
//!
//! Links are cliques. Agents connected through links of blocking agents form a
//! startup group; each member waits until the whole group has registered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use super::model::CustomTool;
use crate::orchestrator::registry::{AgentType, ConfigValue};
use crate::runtime::remote::RemoteRuntime;
use crate::{CoralError, Result};

/// Name of an agent within a graph; also its agent id once connected
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Where a graph agent comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentSource {
    /// Resolved through the agent registry
    Local { agent_type: AgentType },
    /// Hosted by another server
    Remote { remote: RemoteRuntime },
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAgent {
    #[serde(flatten)]
    pub source: AgentSource,
    #[serde(default)]
    pub options: HashMap<String, ConfigValue>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Names of graph tools this agent may call
    #[serde(default)]
    pub extra_tools: BTreeSet<String>,
    /// Whether the agent holds back its startup group
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

impl GraphAgent {
    pub fn local(agent_type: impl Into<String>) -> Self {
        Self {
            source: AgentSource::Local {
                agent_type: AgentType::new(agent_type),
            },
            options: HashMap::new(),
            system_prompt: None,
            extra_tools: BTreeSet::new(),
            blocking: true,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentGraph {
    pub agents: BTreeMap<AgentName, GraphAgent>,
    #[serde(default)]
    pub tools: BTreeMap<String, CustomTool>,
    /// Each set is a clique of mutually linked agents
    #[serde(default)]
    pub links: Vec<BTreeSet<AgentName>>,
}

impl AgentGraph {
    /// Load a graph from a YAML (or JSON) file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let graph: Self = serde_yaml::from_str(content)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn with_agent(mut self, name: impl Into<String>, agent: GraphAgent) -> Self {
        self.agents.insert(AgentName::new(name), agent);
        self
    }

    pub fn with_link<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links
            .push(members.into_iter().map(AgentName::new).collect());
        self
    }

    /// Links and tool references must point at declared entries
    pub fn validate(&self) -> Result<()> {
        for link in &self.links {
            if let Some(unknown) = link.iter().find(|name| !self.agents.contains_key(*name)) {
                return Err(CoralError::InvalidArgument(format!(
                    "link references undeclared agent '{}'",
                    unknown
                )));
            }
        }
        for (name, agent) in &self.agents {
            if let Some(tool) = agent.extra_tools.iter().find(|t| !self.tools.contains_key(*t)) {
                return Err(CoralError::InvalidArgument(format!(
                    "agent '{}' references undeclared tool '{}'",
                    name, tool
                )));
            }
        }
        Ok(())
    }

    pub fn is_blocking(&self, name: &AgentName) -> bool {
        self.agents.get(name).map(|a| a.blocking).unwrap_or(true)
    }

    /// Undirected adjacency built from every link clique
    pub fn adjacency_map(&self) -> BTreeMap<AgentName, BTreeSet<AgentName>> {
        let mut adjacency: BTreeMap<AgentName, BTreeSet<AgentName>> = BTreeMap::new();
        for link in &self.links {
            for a in link {
                for b in link.iter().filter(|b| *b != a) {
                    adjacency.entry(a.clone()).or_default().insert(b.clone());
                }
            }
        }
        adjacency
    }

    /// Connected components of the link graph, restricted to blocking agents.
    /// Agents without links belong to no group.
    pub fn startup_groups(&self) -> Vec<HashSet<String>> {
        let adjacency = self.adjacency_map();
        let mut visited = BTreeSet::new();
        let mut groups = Vec::new();

        for start in adjacency.keys() {
            if visited.contains(start) || !self.is_blocking(start) {
                continue;
            }

            let mut group = HashSet::new();
            let mut to_visit = vec![start.clone()];
            while let Some(node) = to_visit.pop() {
                if visited.contains(&node) || !self.is_blocking(&node) {
                    continue;
                }
                visited.insert(node.clone());
                if let Some(neighbours) = adjacency.get(&node) {
                    to_visit.extend(neighbours.iter().cloned());
                }
                group.insert(node.0);
            }
            groups.push(group);
        }

        groups
    }

    /// Tools an agent was granted, in name order
    pub fn tools_for(&self, agent_id: &str) -> Vec<CustomTool> {
        self.agents
            .get(&AgentName::new(agent_id))
            .map(|agent| {
                agent
                    .extra_tools
                    .iter()
                    .filter_map(|name| self.tools.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
