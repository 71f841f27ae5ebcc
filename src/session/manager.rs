//! Session lifecycle: creation from an agent graph, lookup, teardown

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use super::graph::AgentGraph;
use super::Session;
use crate::orchestrator::Orchestrator;
use crate::{CoralError, Result};

pub struct SessionManager {
    orchestrator: Arc<Orchestrator>,
    sessions: DashMap<String, Arc<Session>>,
    /// Held while a session is being created
    creation: Mutex<()>,
    session_created: Notify,
}

impl SessionManager {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sessions: DashMap::new(),
            creation: Mutex::new(()),
            session_created: Notify::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Create a session with a fresh random id
    pub async fn create_session(
        &self,
        application_id: &str,
        privacy_key: &str,
        agent_graph: Option<AgentGraph>,
    ) -> Result<Arc<Session>> {
        let id = Uuid::new_v4().to_string();
        self.create_session_with_id(&id, application_id, privacy_key, agent_graph)
            .await
    }

    pub async fn create_session_with_id(
        &self,
        session_id: &str,
        application_id: &str,
        privacy_key: &str,
        agent_graph: Option<AgentGraph>,
    ) -> Result<Arc<Session>> {
        let _creating = self.creation.lock().await;
        if self.sessions.contains_key(session_id) {
            return Err(CoralError::AlreadyExists(format!("session {}", session_id)));
        }
        self.create_locked(session_id, application_id, privacy_key, agent_graph)
            .await
    }

    /// Return the session if it exists, otherwise create it
    pub async fn get_or_create_session(
        &self,
        session_id: &str,
        application_id: &str,
        privacy_key: &str,
        agent_graph: Option<AgentGraph>,
    ) -> Result<Arc<Session>> {
        let _creating = self.creation.lock().await;
        if let Some(session) = self.get_session(session_id) {
            return Ok(session);
        }
        self.create_locked(session_id, application_id, privacy_key, agent_graph)
            .await
    }

    async fn create_locked(
        &self,
        session_id: &str,
        application_id: &str,
        privacy_key: &str,
        agent_graph: Option<AgentGraph>,
    ) -> Result<Arc<Session>> {
        let groups = match &agent_graph {
            Some(graph) => {
                graph.validate()?;
                graph.startup_groups()
            }
            None => Vec::new(),
        };

        if let Some(graph) = &agent_graph {
            for (name, agent) in &graph.agents {
                let relative_uri = format!(
                    "{}/{}/{}/sse?agentId={}",
                    application_id, privacy_key, session_id, name
                );
                if let Err(e) = self
                    .orchestrator
                    .spawn(session_id, name.as_str(), agent, &relative_uri)
                    .await
                {
                    error!("Failed to spawn {} for session {}: {}", name, session_id, e);
                    self.orchestrator.destroy(session_id).await;
                    return Err(e);
                }
            }
        }

        let session = Arc::new(Session::new(
            session_id,
            application_id,
            privacy_key,
            agent_graph,
            groups,
        ));
        self.sessions
            .insert(session_id.to_string(), session.clone());
        self.session_created.notify_waiters();
        info!(
            "Session {} created for application {} with {} startup group(s)",
            session_id,
            application_id,
            session.groups().len()
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn get_all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Wait for a session to be created, up to `timeout_ms`
    pub async fn wait_for_session(&self, session_id: &str, timeout_ms: u64) -> Option<Arc<Session>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let created = self.session_created.notified();
            tokio::pin!(created);
            created.as_mut().enable();

            if let Some(session) = self.get_session(session_id) {
                return Some(session);
            }
            if tokio::time::timeout_at(deadline, created).await.is_err() {
                return self.get_session(session_id);
            }
        }
    }

    /// Remove a session, release its waiters and stop its agents
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.clear_all();
        self.orchestrator.destroy(session_id).await;
        info!("Session {} destroyed", session_id);
        true
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.get_all_sessions();
        self.sessions.clear();
        for session in &sessions {
            session.clear_all();
        }
        self.orchestrator.destroy_all().await;
        info!("Shut down {} session(s)", sessions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::registry::AgentRegistry;
    use crate::session::{AgentRegistration, GraphAgent};

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(Orchestrator::new(
            AgentRegistry::new(),
            OrchestratorConfig::default(),
        )))
    }

    #[tokio::test]
    async fn sessions_without_graph_are_indexed() {
        let manager = manager();
        let session = manager.create_session("app", "key", None).await.unwrap();
        assert!(manager.get_session(session.id()).is_some());
        assert_eq!(manager.get_all_sessions().len(), 1);
        assert!(session.groups().is_empty());
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let manager = manager();
        manager.create_session_with_id("s1", "app", "key", None).await.unwrap();
        assert!(matches!(
            manager.create_session_with_id("s1", "app", "key", None).await,
            Err(CoralError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_or_create_returns_the_existing_session() {
        let manager = manager();
        let first = manager.get_or_create_session("s1", "app", "key", None).await.unwrap();
        let second = manager.get_or_create_session("s1", "app", "key", None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn wait_for_session_wakes_on_creation() {
        let manager = Arc::new(manager());
        let waiter = tokio::spawn({
            let manager = manager.clone();
            async move { manager.wait_for_session("late", 2_000).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.create_session_with_id("late", "app", "key", None).await.unwrap();

        let found = waiter.await.unwrap();
        assert_eq!(found.map(|s| s.id().to_string()).as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn wait_for_session_times_out() {
        let manager = manager();
        assert!(manager.wait_for_session("never", 30).await.is_none());
    }

    #[tokio::test]
    async fn failed_spawn_leaves_no_session_behind() {
        let manager = manager();
        let graph = AgentGraph::default().with_agent("a", GraphAgent::local("unregistered"));
        let result = manager.create_session_with_id("s1", "app", "key", Some(graph)).await;
        assert!(matches!(result, Err(CoralError::NotFound(_))));
        assert!(manager.get_session("s1").is_none());
        assert_eq!(manager.orchestrator().handle_count(), 0);
    }

    #[tokio::test]
    async fn invalid_graph_is_rejected() {
        let manager = manager();
        let graph = AgentGraph::default()
            .with_agent("a", GraphAgent::local("x"))
            .with_link(["a", "ghost"]);
        assert!(matches!(
            manager.create_session("app", "key", Some(graph)).await,
            Err(CoralError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn destroy_session_releases_waiters() {
        let manager = manager();
        let session = manager.create_session_with_id("s1", "app", "key", None).await.unwrap();
        session.register_agent(AgentRegistration::new("a")).unwrap();

        let wait = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_mentions("a", 5_000).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.destroy_session("s1").await);
        assert!(wait.await.unwrap().unwrap().is_empty());
        assert!(!manager.destroy_session("s1").await);
        assert!(manager.get_session("s1").is_none());
    }
}
