//! Server configuration: applications, the agent registry, and orchestrator
//! settings, loaded from YAML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestrator::registry::AgentRegistry;
use crate::{CoralError, Result};

/// An application allowed to create sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub privacy_keys: Vec<String>,
}

/// Settings for spawning and tearing down agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Port spawned agents connect back to
    pub server_port: u16,
    /// Output lines replayed to late subscribers of an agent's log bus
    pub log_replay: usize,
    /// Write each agent's output to a file in this directory
    pub agent_log_dir: Option<PathBuf>,
    /// Time a process gets to exit after SIGTERM
    pub destroy_grace_ms: u64,
}

impl OrchestratorConfig {
    pub fn destroy_grace(&self) -> Duration {
        Duration::from_millis(self.destroy_grace_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server_port: 5555,
            log_replay: 512,
            agent_log_dir: None,
            destroy_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub applications: Vec<ApplicationConfig>,
    pub registry: AgentRegistry,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            applications: vec![ApplicationConfig {
                id: "default-app".to_string(),
                name: "Default Application".to_string(),
                description: "Default application for testing".to_string(),
                privacy_keys: vec!["default-key".to_string(), "public".to_string()],
            }],
            registry: AgentRegistry::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoralError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(
            "Loaded {} application(s) and {} agent type(s) from {:?}",
            config.applications.len(),
            config.registry.len(),
            path
        );
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, app) in self.applications.iter().enumerate() {
            if self.applications[..i].iter().any(|a| a.id == app.id) {
                return Err(CoralError::Config(format!(
                    "application '{}' is declared twice",
                    app.id
                )));
            }
        }
        if self.orchestrator.destroy_grace_ms == 0 {
            return Err(CoralError::Config(
                "orchestrator.destroy_grace_ms must be positive".to_string(),
            ));
        }
        self.registry.validate()
    }

    pub fn application(&self, id: &str) -> Option<&ApplicationConfig> {
        self.applications.iter().find(|a| a.id == id)
    }

    /// Whether `privacy_key` opens sessions for application `app_id`
    pub fn authorize(&self, app_id: &str, privacy_key: &str) -> bool {
        self.application(app_id)
            .is_some_and(|app| app.privacy_keys.iter().any(|k| k == privacy_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::registry::AgentType;
    use crate::runtime::AgentRuntime;
    use std::io::Write;

    const CONFIG: &str = r#"
applications:
  - id: research
    name: Research desk
    privacy_keys: [s3cret]
registry:
  claude:
    runtime:
      type: executable
      command: [node, agent.js]
      environment:
        - name: MODEL
          option: MODEL
    options:
      - type: string
        name: MODEL
        default: sonnet
  scout:
    runtime:
      type: docker
      image: coral/scout:1
orchestrator:
  server_port: 7000
  agent_log_dir: /tmp/coral-logs
"#;

    #[test]
    fn default_config_has_default_application() {
        let config = AppConfig::default();
        assert!(config.authorize("default-app", "public"));
        assert!(config.authorize("default-app", "default-key"));
        assert!(!config.authorize("default-app", "nope"));
        assert!(!config.authorize("other", "public"));
        assert_eq!(config.orchestrator.server_port, 5555);
    }

    #[test]
    fn parses_full_config() {
        let config = AppConfig::from_yaml_str(CONFIG).unwrap();
        assert!(config.authorize("research", "s3cret"));
        assert_eq!(config.registry.len(), 2);

        let claude = config.registry.get(&AgentType::new("claude")).unwrap();
        assert!(matches!(claude.runtime, AgentRuntime::Executable(_)));
        assert_eq!(claude.options.len(), 1);

        assert_eq!(config.orchestrator.server_port, 7000);
        assert_eq!(config.orchestrator.log_replay, 512);
        assert_eq!(config.orchestrator.destroy_grace(), Duration::from_secs(30));
        assert_eq!(
            config.orchestrator.agent_log_dir.as_deref(),
            Some(Path::new("/tmp/coral-logs"))
        );
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert!(config.application("research").is_some());
    }

    #[test]
    fn load_reports_missing_file_as_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(&dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(CoralError::Config(_))));
    }

    #[test]
    fn rejects_duplicate_applications() {
        let yaml = r#"
applications:
  - { id: a, name: A }
  - { id: a, name: Again }
"#;
        assert!(matches!(
            AppConfig::from_yaml_str(yaml),
            Err(CoralError::Config(_))
        ));
    }
}
