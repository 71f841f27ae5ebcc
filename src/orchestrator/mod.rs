//! Orchestration service: spawns the agents of a session and tears them down.

pub mod registry;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::runtime::{AgentRuntime, RuntimeEvent, RuntimeHandle, RuntimeParams};
use crate::session::{AgentSource, GraphAgent};
use crate::Result;
use registry::AgentRegistry;

/// Owns every running agent and the log bus of each
pub struct Orchestrator {
    registry: AgentRegistry,
    settings: OrchestratorConfig,
    /// Output of each agent, keyed by (session, agent)
    buses: DashMap<(String, String), EventBus<RuntimeEvent>>,
    handles: Mutex<Vec<Box<dyn RuntimeHandle>>>,
}

impl Orchestrator {
    pub fn new(registry: AgentRegistry, settings: OrchestratorConfig) -> Self {
        Self {
            registry,
            settings,
            buses: DashMap::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorConfig {
        &self.settings
    }

    /// Log bus of an agent, if it was ever spawned
    pub fn get_bus(&self, session_id: &str, agent_name: &str) -> Option<EventBus<RuntimeEvent>> {
        self.buses
            .get(&(session_id.to_string(), agent_name.to_string()))
            .map(|bus| bus.clone())
    }

    fn bus_for(&self, session_id: &str, agent_name: &str) -> EventBus<RuntimeEvent> {
        self.buses
            .entry((session_id.to_string(), agent_name.to_string()))
            .or_insert_with(|| EventBus::new(self.settings.log_replay))
            .clone()
    }

    /// Spawn one agent of a session graph
    pub async fn spawn(
        &self,
        session_id: &str,
        agent_name: &str,
        agent: &GraphAgent,
        relative_uri: &str,
    ) -> Result<()> {
        let mut params = RuntimeParams::new(
            session_id,
            agent_name,
            self.settings.server_port,
            relative_uri,
        );
        params.system_prompt = agent.system_prompt.clone();
        params.agent_log_dir = self.settings.agent_log_dir.clone();
        params.destroy_grace = self.settings.destroy_grace();

        match &agent.source {
            AgentSource::Local { agent_type } => {
                let entry = self.registry.get(agent_type)?;
                params.options = entry.resolve_options(&agent.options)?;
                self.spawn_runtime(&entry.runtime, params).await
            }
            AgentSource::Remote { remote } => {
                params.options = agent.options.clone();
                self.spawn_runtime(&AgentRuntime::Remote(remote.clone()), params)
                    .await
            }
        }
    }

    /// Spawn with an explicit runtime, recording the handle on success
    pub async fn spawn_runtime(&self, runtime: &AgentRuntime, params: RuntimeParams) -> Result<()> {
        let bus = self.bus_for(&params.session_id, &params.agent_name);
        let handle = runtime.spawn(&params, bus).await?;
        info!(
            "Spawned {} ({}) for session {}",
            params.agent_name,
            runtime.name(),
            params.session_id
        );
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Destroy every agent of a session and drop its log buses
    pub async fn destroy(&self, session_id: &str) {
        let targets: Vec<Box<dyn RuntimeHandle>> = {
            let mut handles = self.handles.lock();
            let (targets, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *handles)
                .into_iter()
                .partition(|h| h.session_id() == session_id);
            *handles = keep;
            targets
        };

        info!("Destroying {} agent(s) of session {}", targets.len(), session_id);
        destroy_handles(targets).await;
        self.buses.retain(|(session, _), _| session != session_id);
    }

    /// Destroy every agent this orchestrator started
    pub async fn destroy_all(&self) {
        let targets = std::mem::take(&mut *self.handles.lock());
        info!("Destroying all {} agent(s)", targets.len());
        destroy_handles(targets).await;
        self.buses.clear();
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn session_handle_count(&self, session_id: &str) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.session_id() == session_id)
            .count()
    }
}

/// Destroy handles concurrently; a failure or panic in one does not affect
/// the others.
async fn destroy_handles(handles: Vec<Box<dyn RuntimeHandle>>) {
    let tasks = handles.into_iter().map(|handle| {
        tokio::spawn(async move {
            let result = handle.destroy().await;
            (handle.agent_name().to_string(), result)
        })
    });

    for outcome in join_all(tasks).await {
        match outcome {
            Ok((_, Ok(()))) => {}
            Ok((agent, Err(e))) => warn!("Failed to destroy {}: {}", agent, e),
            Err(e) => error!("Destroy task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::remote::RemoteRuntime;
    use crate::{CoralError, Result};
    use async_trait::async_trait;
    use registry::{ConfigEntry, ConfigValue, RegistryAgent};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandle {
        session_id: String,
        agent_name: String,
        destroyed: Arc<AtomicUsize>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    #[async_trait]
    impl RuntimeHandle for FakeHandle {
        fn session_id(&self) -> &str {
            &self.session_id
        }

        fn agent_name(&self) -> &str {
            &self.agent_name
        }

        async fn destroy(&self) -> Result<()> {
            match self.behaviour {
                Behaviour::Ok => {
                    self.destroyed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Behaviour::Fail => Err(CoralError::Teardown(format!("{} refused", self.agent_name))),
                Behaviour::Panic => panic!("{} exploded", self.agent_name),
            }
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(AgentRegistry::new(), OrchestratorConfig::default())
    }

    fn push(
        orchestrator: &Orchestrator,
        session: &str,
        agent: &str,
        behaviour: Behaviour,
        destroyed: &Arc<AtomicUsize>,
    ) {
        orchestrator.handles.lock().push(Box::new(FakeHandle {
            session_id: session.to_string(),
            agent_name: agent.to_string(),
            destroyed: destroyed.clone(),
            behaviour,
        }));
    }

    #[tokio::test]
    async fn destroy_continues_past_failing_handle() {
        let orchestrator = orchestrator();
        let destroyed = Arc::new(AtomicUsize::new(0));
        push(&orchestrator, "s1", "one", Behaviour::Ok, &destroyed);
        push(&orchestrator, "s1", "two", Behaviour::Fail, &destroyed);
        push(&orchestrator, "s1", "three", Behaviour::Ok, &destroyed);
        push(&orchestrator, "s2", "other", Behaviour::Ok, &destroyed);

        orchestrator.destroy("s1").await;

        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.session_handle_count("s1"), 0);
        assert_eq!(orchestrator.session_handle_count("s2"), 1);
    }

    #[tokio::test]
    async fn destroy_isolates_panicking_handle() {
        let orchestrator = orchestrator();
        let destroyed = Arc::new(AtomicUsize::new(0));
        push(&orchestrator, "s1", "one", Behaviour::Panic, &destroyed);
        push(&orchestrator, "s1", "two", Behaviour::Ok, &destroyed);

        orchestrator.destroy("s1").await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.handle_count(), 0);
    }

    #[tokio::test]
    async fn destroy_all_clears_every_session() {
        let orchestrator = orchestrator();
        let destroyed = Arc::new(AtomicUsize::new(0));
        push(&orchestrator, "s1", "a", Behaviour::Ok, &destroyed);
        push(&orchestrator, "s2", "b", Behaviour::Ok, &destroyed);

        orchestrator.destroy_all().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.handle_count(), 0);
    }

    #[tokio::test]
    async fn unknown_agent_type_is_not_found() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .spawn("s1", "a", &GraphAgent::local("ghost"), "app/key/s1/sse?agentId=a")
            .await;
        assert!(matches!(result, Err(CoralError::NotFound(_))));
        assert_eq!(orchestrator.handle_count(), 0);
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_before_spawning() {
        let registry = AgentRegistry::new().with_agent(
            "echo",
            RegistryAgent::new(AgentRuntime::Executable(
                crate::runtime::ExecutableRuntime::new(["true"]),
            ))
            .with_option(ConfigEntry::String {
                name: "MODEL".into(),
                description: None,
                default: Some("small".into()),
            }),
        );
        let orchestrator = Orchestrator::new(registry, OrchestratorConfig::default());

        let mut agent = GraphAgent::local("echo");
        agent
            .options
            .insert("COLOR".to_string(), ConfigValue::Str("red".into()));
        let result = orchestrator
            .spawn("s1", "a", &agent, "app/key/s1/sse?agentId=a")
            .await;
        assert!(matches!(result, Err(CoralError::InvalidArgument(_))));
        assert_eq!(orchestrator.handle_count(), 0);
    }

    #[tokio::test]
    async fn remote_agents_are_not_implemented() {
        let orchestrator = orchestrator();
        let mut agent = GraphAgent::local("unused");
        agent.source = AgentSource::Remote {
            remote: RemoteRuntime {
                host: "elsewhere".into(),
                agent_type: "x".into(),
                app_id: "app".into(),
                privacy_key: "key".into(),
            },
        };
        let result = orchestrator
            .spawn("s1", "a", &agent, "app/key/s1/sse?agentId=a")
            .await;
        assert!(matches!(result, Err(CoralError::NotImplemented(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_agent_output_reaches_its_bus() {
        let registry = AgentRegistry::new().with_agent(
            "echo",
            RegistryAgent::new(AgentRuntime::Executable(
                crate::runtime::ExecutableRuntime::new(["sh", "-c", "echo \"hello from $CORAL_AGENT_ID\""]),
            )),
        );
        let orchestrator = Orchestrator::new(registry, OrchestratorConfig::default());
        orchestrator
            .spawn("s1", "greeter", &GraphAgent::local("echo"), "app/key/s1/sse?agentId=greeter")
            .await
            .unwrap();
        assert_eq!(orchestrator.session_handle_count("s1"), 1);

        let bus = orchestrator.get_bus("s1", "greeter").unwrap();
        let mut rx = bus.subscribe();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            RuntimeEvent::Log { ref message, .. } if message == "hello from greeter"
        ));

        orchestrator.destroy("s1").await;
        assert!(orchestrator.get_bus("s1", "greeter").is_none());
    }
}
