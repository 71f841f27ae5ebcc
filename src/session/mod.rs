//! Sessions: agents, threads, mentions and the waits that block on them
//!
//! Each collection is its own concurrent map; there is no session-wide lock.
//! A thread's messages are guarded by that thread's lock, which also orders
//! the `MessageSent` events for it.

pub mod events;
pub mod graph;
pub mod manager;
pub mod model;
mod waiters;

pub use events::SessionEvent;
pub use graph::{AgentGraph, AgentName, AgentSource, GraphAgent};
pub use manager::SessionManager;
pub use model::{
    Agent, AgentRegistration, CustomTool, DEBUG_CREATOR_ID, Message, SYSTEM_AGENT_ID, Thread,
    ToolSchema, ToolTransport,
};

use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusReceiver, EventBus};
use crate::scheduler::{CountBasedScheduler, GroupScheduler};
use crate::{CoralError, Result};
use waiters::Waiters;

/// Session events kept for observers that attach late
const SESSION_EVENT_REPLAY: usize = 256;

/// Palette size for `color_for_sender`
const SENDER_COLORS: u32 = 10;

/// A wait for messages sent by any of `from` to threads `agent_id` is in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SenderKey {
    agent_id: String,
    from: BTreeSet<String>,
}

type SharedThread = Arc<RwLock<Thread>>;

pub struct Session {
    id: String,
    application_id: String,
    privacy_key: String,
    agent_graph: Option<AgentGraph>,
    dev_required_agent_start_count: AtomicUsize,

    agents: DashMap<String, Agent>,
    debug_agents: DashSet<String>,
    threads: DashMap<String, SharedThread>,
    /// Serializes the open-name check with the insert
    thread_creation: Mutex<()>,
    /// Next undelivered position per (agent, thread)
    read_cursors: DashMap<(String, String), usize>,

    mention_waiters: Waiters<String>,
    sender_waiters: Waiters<SenderKey>,

    group_scheduler: GroupScheduler,
    count_scheduler: CountBasedScheduler,
    events: EventBus<SessionEvent>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        application_id: impl Into<String>,
        privacy_key: impl Into<String>,
        agent_graph: Option<AgentGraph>,
        groups: Vec<HashSet<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            application_id: application_id.into(),
            privacy_key: privacy_key.into(),
            agent_graph,
            dev_required_agent_start_count: AtomicUsize::new(0),
            agents: DashMap::new(),
            debug_agents: DashSet::new(),
            threads: DashMap::new(),
            thread_creation: Mutex::new(()),
            read_cursors: DashMap::new(),
            mention_waiters: Waiters::new(),
            sender_waiters: Waiters::new(),
            group_scheduler: GroupScheduler::new(groups),
            count_scheduler: CountBasedScheduler::new(),
            events: EventBus::new(SESSION_EVENT_REPLAY),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn privacy_key(&self) -> &str {
        &self.privacy_key
    }

    pub fn agent_graph(&self) -> Option<&AgentGraph> {
        self.agent_graph.as_ref()
    }

    pub fn groups(&self) -> &[HashSet<String>] {
        self.group_scheduler.groups()
    }

    pub fn dev_required_agent_start_count(&self) -> usize {
        self.dev_required_agent_start_count.load(Ordering::Relaxed)
    }

    pub fn set_dev_required_agent_start_count(&self, count: usize) {
        self.dev_required_agent_start_count
            .store(count, Ordering::Relaxed);
    }

    /// Subscribe to this session's events, starting with recent history
    pub fn events(&self) -> BusReceiver<SessionEvent> {
        self.events.subscribe()
    }

    // ---- agents ----

    pub fn register_agent(&self, registration: AgentRegistration) -> Result<Agent> {
        let agent = Agent {
            extra_tools: self
                .agent_graph
                .as_ref()
                .map(|g| g.tools_for(&registration.id))
                .unwrap_or_default(),
            id: registration.id,
            description: registration.description,
            mcp_url: registration.mcp_url,
        };

        match self.agents.entry(agent.id.clone()) {
            Entry::Occupied(mut existing) => {
                if !registration.force {
                    warn!("Agent {} is already registered in session {}", agent.id, self.id);
                    return Err(CoralError::AlreadyExists(format!("agent {}", agent.id)));
                }
                info!("Re-registering agent {} in session {}", agent.id, self.id);
                existing.insert(agent.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(agent.clone());
            }
        }

        self.group_scheduler.register_agent(&agent.id);
        self.count_scheduler.register_agent(&agent.id);
        self.events.emit(SessionEvent::AgentRegistered {
            agent: agent.clone(),
        });
        info!("Agent {} registered in session {}", agent.id, self.id);
        Ok(agent)
    }

    /// Register an observer agent that is hidden from peers
    pub fn register_debug_agent(&self) -> Agent {
        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            description: String::new(),
            mcp_url: None,
            extra_tools: Vec::new(),
        };
        self.agents.insert(agent.id.clone(), agent.clone());
        self.debug_agents.insert(agent.id.clone());
        debug!("Debug agent {} attached to session {}", agent.id, self.id);
        agent
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn get_all_agents(&self, include_debug: bool) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| include_debug || !self.debug_agents.contains(a.key()))
            .map(|a| a.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn registered_agent_count(&self) -> usize {
        self.count_scheduler.registered_count()
    }

    pub async fn wait_for_group(&self, agent_id: &str, timeout_ms: u64) -> bool {
        self.group_scheduler.wait_for_group(agent_id, timeout_ms).await
    }

    pub async fn wait_for_agent_count(&self, target: usize, timeout_ms: u64) -> bool {
        self.count_scheduler
            .wait_for_agent_count(target, timeout_ms)
            .await
    }

    /// Stable palette index for a sender, used by debug views
    pub fn color_for_sender(&self, sender_id: &str) -> u32 {
        sender_id
            .bytes()
            .fold(0u32, |hash, b| hash.wrapping_mul(31).wrapping_add(b as u32))
            % SENDER_COLORS
    }

    // ---- threads ----

    pub fn create_thread(
        &self,
        name: &str,
        creator_id: &str,
        participant_ids: &[String],
    ) -> Result<Thread> {
        if creator_id != DEBUG_CREATOR_ID && !self.agents.contains_key(creator_id) {
            return Err(CoralError::NotFound(format!("creator agent {}", creator_id)));
        }

        let mut participants: Vec<String> = Vec::with_capacity(participant_ids.len() + 1);
        for id in participant_ids {
            if self.agents.contains_key(id) && !participants.contains(id) {
                participants.push(id.clone());
            }
        }
        if !participants.iter().any(|p| p == creator_id) {
            participants.push(creator_id.to_string());
        }

        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            creator_id: creator_id.to_string(),
            participants,
            messages: Vec::new(),
            is_closed: false,
            summary: None,
        };

        {
            let _creating = self.thread_creation.lock();
            let name_taken = self.shared_threads().iter().any(|t| {
                let t = t.read();
                !t.is_closed && t.name == name
            });
            if name_taken {
                return Err(CoralError::InvalidArgument(format!(
                    "an open thread named '{}' already exists",
                    name
                )));
            }
            self.threads
                .insert(thread.id.clone(), Arc::new(RwLock::new(thread.clone())));
        }

        self.events.emit(SessionEvent::ThreadCreated {
            id: thread.id.clone(),
            name: thread.name.clone(),
            creator_id: thread.creator_id.clone(),
            participants: thread.participants.clone(),
            summary: None,
        });
        info!(
            "Thread '{}' ({}) created by {} in session {}",
            thread.name, thread.id, creator_id, self.id
        );
        Ok(thread)
    }

    pub fn get_thread(&self, thread_id: &str) -> Option<Thread> {
        self.shared_thread(thread_id).map(|t| t.read().clone())
    }

    pub fn get_all_threads(&self) -> Vec<Thread> {
        self.shared_threads()
            .iter()
            .map(|t| t.read().clone())
            .collect()
    }

    pub fn get_threads_for_agent(&self, agent_id: &str) -> Vec<Thread> {
        self.shared_threads()
            .iter()
            .filter_map(|t| {
                let t = t.read();
                t.has_participant(agent_id).then(|| t.clone())
            })
            .collect()
    }

    pub fn add_participant(&self, thread_id: &str, participant_id: &str) -> bool {
        let Some(thread) = self.shared_thread(thread_id) else {
            return false;
        };
        if !self.agents.contains_key(participant_id) {
            return false;
        }

        let mut thread = thread.write();
        if thread.is_closed {
            return false;
        }
        if !thread.has_participant(participant_id) {
            thread.participants.push(participant_id.to_string());
            self.read_cursors
                .insert((participant_id.to_string(), thread_id.to_string()), 0);
            self.events.emit(SessionEvent::ParticipantAdded {
                thread_id: thread_id.to_string(),
                agent_id: participant_id.to_string(),
            });
            info!("{} joined thread {}", participant_id, thread_id);
        }
        true
    }

    /// The creator cannot be removed from their own thread
    pub fn remove_participant(&self, thread_id: &str, participant_id: &str) -> bool {
        let Some(thread) = self.shared_thread(thread_id) else {
            return false;
        };
        if !self.agents.contains_key(participant_id) {
            return false;
        }

        let mut thread = thread.write();
        if thread.is_closed || thread.creator_id == participant_id {
            return false;
        }
        let before = thread.participants.len();
        thread.participants.retain(|p| p != participant_id);
        if thread.participants.len() == before {
            return false;
        }

        self.read_cursors
            .remove(&(participant_id.to_string(), thread_id.to_string()));
        self.events.emit(SessionEvent::ParticipantRemoved {
            thread_id: thread_id.to_string(),
            agent_id: participant_id.to_string(),
        });
        info!("{} left thread {}", participant_id, thread_id);
        true
    }

    pub fn close_thread(&self, thread_id: &str, summary: &str) -> bool {
        let Some(thread) = self.shared_thread(thread_id) else {
            return false;
        };

        let mut thread = thread.write();
        if thread.is_closed {
            return false;
        }
        thread.is_closed = true;
        thread.summary = Some(summary.to_string());
        self.events.emit(SessionEvent::ThreadClosed {
            thread_id: thread_id.to_string(),
            summary: summary.to_string(),
        });
        info!("Thread {} closed", thread_id);
        true
    }

    // ---- messages ----

    pub fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        content: impl Into<String>,
        mentions: Vec<String>,
    ) -> Result<Message> {
        let thread = self
            .shared_thread(thread_id)
            .ok_or_else(|| CoralError::NotFound(format!("thread {}", thread_id)))?;
        if sender_id != SYSTEM_AGENT_ID && !self.agents.contains_key(sender_id) {
            return Err(CoralError::NotFound(format!("sender agent {}", sender_id)));
        }

        let (message, participants) = {
            let mut thread = thread.write();
            if thread.is_closed {
                return Err(CoralError::InvalidArgument(format!(
                    "thread {} is closed",
                    thread_id
                )));
            }
            let message = Message {
                id: Uuid::new_v4().to_string(),
                thread_id: thread_id.to_string(),
                sender_id: sender_id.to_string(),
                content: content.into(),
                mentions,
                timestamp: chrono::Utc::now().timestamp_millis(),
                position: thread.messages.len(),
            };
            thread.messages.push(message.clone());
            self.events.emit(SessionEvent::MessageSent {
                thread_id: thread_id.to_string(),
                message: message.clone(),
            });
            (message, thread.participants.clone())
        };

        self.notify(&message, &participants);
        debug!(
            "Message {} from {} in thread {}",
            message.position, sender_id, thread_id
        );
        Ok(message)
    }

    fn notify(&self, message: &Message, participants: &[String]) {
        let mut woken = 0;
        if message.is_from_system() {
            for participant in participants {
                woken += self.mention_waiters.wake(participant, message);
            }
        } else {
            // Mentions only reach agents that can read the thread
            for mentioned in message
                .mentions
                .iter()
                .filter(|m| participants.contains(*m))
            {
                woken += self.mention_waiters.wake(mentioned, message);
            }
        }
        woken += self.sender_waiters.wake_matching(
            |key| {
                key.from.contains(&message.sender_id)
                    && participants.iter().any(|p| *p == key.agent_id)
            },
            message,
        );
        if woken > 0 {
            debug!("Woke {} waiter(s) for message in {}", woken, message.thread_id);
        }
    }

    /// Unread messages that mention the agent or come from the system
    pub fn get_unread_messages_for_agent(&self, agent_id: &str) -> Vec<Message> {
        self.unread_where(agent_id, |m| m.mentions_agent(agent_id) || m.is_from_system())
    }

    /// Unread messages sent by any of `from_agent_ids`
    pub fn get_unread_messages_from_agents(
        &self,
        agent_id: &str,
        from_agent_ids: &BTreeSet<String>,
    ) -> Vec<Message> {
        self.unread_where(agent_id, |m| from_agent_ids.contains(&m.sender_id))
    }

    fn unread_where(&self, agent_id: &str, relevant: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut unread = Vec::new();
        for thread in self.shared_threads() {
            let thread = thread.read();
            if !thread.has_participant(agent_id) {
                continue;
            }
            let cursor = self
                .read_cursors
                .get(&(agent_id.to_string(), thread.id.clone()))
                .map(|c| *c)
                .unwrap_or(0);
            unread.extend(
                thread
                    .messages
                    .iter()
                    .skip(cursor)
                    .filter(|m| relevant(m))
                    .cloned(),
            );
        }
        sort_for_delivery(&mut unread);
        unread
    }

    /// Wait until a message mentions the agent (or the system posts to one
    /// of its threads). Returns immediately with any unread ones.
    pub async fn wait_for_mentions(&self, agent_id: &str, timeout_ms: u64) -> Result<Vec<Message>> {
        self.check_wait(agent_id, timeout_ms)?;

        let key = agent_id.to_string();
        let registration = self.mention_waiters.register(key.clone());
        let unread = self.get_unread_messages_for_agent(agent_id);
        if !unread.is_empty() {
            self.mention_waiters.deregister(&key, registration.token);
            self.advance_cursors(agent_id, &unread);
            return Ok(unread);
        }

        let started = Instant::now();
        let woken = wait_for_wake(registration.rx, timeout_ms).await;
        self.mention_waiters.deregister(&key, registration.token);
        let delivered = match woken {
            Some(message) => {
                with_woken(self.get_unread_messages_for_agent(agent_id), message)
            }
            None => Vec::new(),
        };
        debug!(
            "{} waited {:?} for mentions, got {}",
            agent_id,
            started.elapsed(),
            delivered.len()
        );
        self.advance_cursors(agent_id, &delivered);
        Ok(delivered)
    }

    /// Wait until one of `from_agent_ids` posts to a thread the agent is in
    pub async fn wait_for_agent_messages(
        &self,
        agent_id: &str,
        from_agent_ids: &[String],
        timeout_ms: u64,
    ) -> Result<Vec<Message>> {
        self.check_wait(agent_id, timeout_ms)?;

        let from: BTreeSet<String> = from_agent_ids.iter().cloned().collect();
        let key = SenderKey {
            agent_id: agent_id.to_string(),
            from: from.clone(),
        };
        let registration = self.sender_waiters.register(key.clone());
        let unread = self.get_unread_messages_from_agents(agent_id, &from);
        if !unread.is_empty() {
            self.sender_waiters.deregister(&key, registration.token);
            self.advance_cursors(agent_id, &unread);
            return Ok(unread);
        }

        let woken = wait_for_wake(registration.rx, timeout_ms).await;
        self.sender_waiters.deregister(&key, registration.token);
        let delivered = match woken {
            Some(message) => with_woken(
                self.get_unread_messages_from_agents(agent_id, &from),
                message,
            ),
            None => Vec::new(),
        };
        self.advance_cursors(agent_id, &delivered);
        Ok(delivered)
    }

    fn check_wait(&self, agent_id: &str, timeout_ms: u64) -> Result<()> {
        if timeout_ms == 0 {
            return Err(CoralError::InvalidArgument(
                "timeout must be positive".to_string(),
            ));
        }
        if !self.agents.contains_key(agent_id) {
            return Err(CoralError::NotFound(format!("agent {}", agent_id)));
        }
        Ok(())
    }

    /// Move each touched thread's cursor past the delivered messages
    fn advance_cursors(&self, agent_id: &str, delivered: &[Message]) {
        for message in delivered {
            let next = message.position + 1;
            self.read_cursors
                .entry((agent_id.to_string(), message.thread_id.clone()))
                .and_modify(|cursor| *cursor = (*cursor).max(next))
                .or_insert(next);
        }
    }

    /// Drop every agent, thread and pending wait
    pub fn clear_all(&self) {
        self.mention_waiters.clear();
        self.sender_waiters.clear();
        self.threads.clear();
        self.read_cursors.clear();
        self.agents.clear();
        self.debug_agents.clear();
        self.group_scheduler.clear();
        self.count_scheduler.clear();
        info!("Session {} cleared", self.id);
    }

    fn shared_thread(&self, thread_id: &str) -> Option<SharedThread> {
        self.threads.get(thread_id).map(|t| t.value().clone())
    }

    fn shared_threads(&self) -> Vec<SharedThread> {
        self.threads.iter().map(|t| t.value().clone()).collect()
    }
}

async fn wait_for_wake(rx: oneshot::Receiver<Message>, timeout_ms: u64) -> Option<Message> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(message)) => Some(message),
        _ => None,
    }
}

/// Unread messages plus the one that caused the wake, without duplicates
fn with_woken(mut unread: Vec<Message>, woken: Message) -> Vec<Message> {
    if !unread.iter().any(|m| m.id == woken.id) {
        unread.push(woken);
        sort_for_delivery(&mut unread);
    }
    unread
}

/// Oldest first across threads; append order within a thread
fn sort_for_delivery(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        (a.timestamp, &a.thread_id, a.position).cmp(&(b.timestamp, &b.thread_id, b.position))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(agents: &[&str]) -> Session {
        let session = Session::new("s1", "app", "key", None, Vec::new());
        for id in agents {
            session.register_agent(AgentRegistration::new(*id)).unwrap();
        }
        session
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_registration_requires_force() {
        let session = session_with(&["a"]);
        let again = session.register_agent(AgentRegistration::new("a"));
        assert!(matches!(again, Err(CoralError::AlreadyExists(_))));

        let forced = session
            .register_agent(AgentRegistration::new("a").description("reconnected").force(true))
            .unwrap();
        assert_eq!(forced.description, "reconnected");
        assert_eq!(session.registered_agent_count(), 1);
    }

    #[test]
    fn create_thread_filters_dedupes_and_includes_creator() {
        let session = session_with(&["a", "b"]);
        let thread = session
            .create_thread("plan", "a", &ids(&["b", "ghost", "b"]))
            .unwrap();
        assert_eq!(thread.participants, ids(&["b", "a"]));
        assert_eq!(thread.creator_id, "a");
    }

    #[test]
    fn create_thread_requires_known_creator_except_debug() {
        let session = session_with(&["a"]);
        assert!(matches!(
            session.create_thread("t", "ghost", &[]),
            Err(CoralError::NotFound(_))
        ));
        let debug_thread = session.create_thread("t", DEBUG_CREATOR_ID, &ids(&["a"])).unwrap();
        assert_eq!(debug_thread.participants, ids(&["a", "debug"]));
    }

    #[test]
    fn open_thread_names_are_unique() {
        let session = session_with(&["a"]);
        let first = session.create_thread("plan", "a", &[]).unwrap();
        assert!(matches!(
            session.create_thread("plan", "a", &[]),
            Err(CoralError::InvalidArgument(_))
        ));
        session.close_thread(&first.id, "done");
        assert!(session.create_thread("plan", "a", &[]).is_ok());
    }

    #[test]
    fn closed_thread_rejects_participants_and_messages() {
        let session = session_with(&["a", "b"]);
        let thread = session.create_thread("t", "a", &[]).unwrap();
        assert!(session.close_thread(&thread.id, "wrapped up"));
        assert!(!session.close_thread(&thread.id, "again"));

        assert!(!session.add_participant(&thread.id, "b"));
        assert_eq!(session.get_thread(&thread.id).unwrap().participants, ids(&["a"]));
        assert!(matches!(
            session.send_message(&thread.id, "a", "late", vec![]),
            Err(CoralError::InvalidArgument(_))
        ));
        assert_eq!(
            session.get_thread(&thread.id).unwrap().summary.as_deref(),
            Some("wrapped up")
        );
    }

    #[test]
    fn participant_changes_report_outcome() {
        let session = session_with(&["a", "b"]);
        let thread = session.create_thread("t", "a", &[]).unwrap();

        assert!(!session.add_participant("missing", "b"));
        assert!(!session.add_participant(&thread.id, "ghost"));
        assert!(session.add_participant(&thread.id, "b"));
        assert!(session.add_participant(&thread.id, "b"));
        assert_eq!(session.get_thread(&thread.id).unwrap().participants, ids(&["a", "b"]));

        assert!(!session.remove_participant(&thread.id, "a"));
        assert!(session.remove_participant(&thread.id, "b"));
        assert!(!session.remove_participant(&thread.id, "b"));
        assert!(session.get_threads_for_agent("b").is_empty());
    }

    #[test]
    fn send_message_validates_thread_and_sender() {
        let session = session_with(&["a"]);
        let thread = session.create_thread("t", "a", &[]).unwrap();
        assert!(matches!(
            session.send_message("missing", "a", "x", vec![]),
            Err(CoralError::NotFound(_))
        ));
        assert!(matches!(
            session.send_message(&thread.id, "ghost", "x", vec![]),
            Err(CoralError::NotFound(_))
        ));
        assert!(session.send_message(&thread.id, SYSTEM_AGENT_ID, "x", vec![]).is_ok());
    }

    #[test]
    fn messages_keep_append_order() {
        let session = session_with(&["a", "b"]);
        let thread = session.create_thread("t", "a", &ids(&["b"])).unwrap();
        for i in 0..5 {
            session
                .send_message(&thread.id, "a", format!("m{}", i), vec![])
                .unwrap();
        }
        let thread = session.get_thread(&thread.id).unwrap();
        let contents: Vec<&str> = thread.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(thread.messages.iter().enumerate().all(|(i, m)| m.position == i));
    }

    #[tokio::test]
    async fn unread_mentions_are_returned_once() {
        let session = session_with(&["a", "b"]);
        let thread = session.create_thread("t", "a", &ids(&["b"])).unwrap();
        session.send_message(&thread.id, "a", "one", ids(&["b"])).unwrap();
        session.send_message(&thread.id, "a", "aside", vec![]).unwrap();
        session.send_message(&thread.id, "a", "two", ids(&["b"])).unwrap();

        let first = session.wait_for_mentions("b", 1_000).await.unwrap();
        let contents: Vec<&str> = first.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);

        let second = session.wait_for_mentions("b", 20).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn wait_rejects_bad_arguments() {
        let session = session_with(&["a"]);
        assert!(matches!(
            session.wait_for_mentions("a", 0).await,
            Err(CoralError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.wait_for_mentions("ghost", 10).await,
            Err(CoralError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mention_wakes_only_the_mentioned_agent() {
        let session = Arc::new(session_with(&["a", "b", "c"]));
        let thread = session.create_thread("t", "a", &ids(&["b", "c"])).unwrap();

        let b = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_mentions("b", 2_000).await }
        });
        let c = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_mentions("c", 200).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.send_message(&thread.id, "a", "hi", ids(&["b"])).unwrap();

        let woke = b.await.unwrap().unwrap();
        assert_eq!(woke.len(), 1);
        assert_eq!(woke[0].content, "hi");
        assert!(c.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_message_wakes_every_participant() {
        let session = Arc::new(session_with(&["a", "b"]));
        let thread = session.create_thread("t", "a", &ids(&["b"])).unwrap();

        let waits: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let session = session.clone();
                tokio::spawn(async move { session.wait_for_mentions(id, 2_000).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session
            .send_message(&thread.id, SYSTEM_AGENT_ID, "wrap up", vec![])
            .unwrap();

        for wait in waits {
            let delivered = wait.await.unwrap().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].sender_id, SYSTEM_AGENT_ID);
        }
    }

    #[tokio::test]
    async fn concurrent_waits_for_the_same_agent_all_wake() {
        let session = Arc::new(session_with(&["a", "b"]));
        let thread = session.create_thread("t", "a", &ids(&["b"])).unwrap();

        let waits: Vec<_> = (0..2)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.wait_for_mentions("b", 2_000).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.send_message(&thread.id, "a", "hi", ids(&["b"])).unwrap();

        for wait in waits {
            assert_eq!(wait.await.unwrap().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn sender_filtered_wait_matches_sender_only() {
        let session = Arc::new(session_with(&["a", "b", "c"]));
        let thread = session.create_thread("t", "a", &ids(&["b", "c"])).unwrap();

        let wait = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .wait_for_agent_messages("b", &ids(&["c"]), 2_000)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.send_message(&thread.id, "a", "not you", vec![]).unwrap();
        session.send_message(&thread.id, "c", "from c", vec![]).unwrap();

        let delivered = wait.await.unwrap().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].content, "from c");
    }

    #[tokio::test]
    async fn unread_across_threads_comes_back_in_send_order() {
        let session = session_with(&["a", "b"]);
        let first = session.create_thread("first", "a", &ids(&["b"])).unwrap();
        let second = session.create_thread("second", "a", &ids(&["b"])).unwrap();

        let order = [(&second, "s1"), (&first, "f1"), (&second, "s2"), (&first, "f2")];
        for (thread, content) in order {
            session.send_message(&thread.id, "a", content, ids(&["b"])).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let unread = session.get_unread_messages_for_agent("b");
        let contents: Vec<&str> = unread.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["s1", "f1", "s2", "f2"]);
    }

    #[tokio::test]
    async fn mention_outside_the_thread_does_not_wake() {
        let session = Arc::new(session_with(&["a", "b", "outsider"]));
        let thread = session.create_thread("t", "a", &ids(&["b"])).unwrap();

        let wait = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_mentions("outsider", 200).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session
            .send_message(&thread.id, "a", "hey", ids(&["outsider"]))
            .unwrap();

        assert!(wait.await.unwrap().unwrap().is_empty());
        assert!(
            session
                .read_cursors
                .get(&("outsider".to_string(), thread.id.clone()))
                .is_none()
        );
    }

    #[tokio::test]
    async fn timed_out_wait_leaves_no_waiter_behind() {
        let session = session_with(&["a"]);
        let delivered = session.wait_for_mentions("a", 20).await.unwrap();
        assert!(delivered.is_empty());
        assert_eq!(session.mention_waiters.len(), 0);
    }

    #[tokio::test]
    async fn clear_all_releases_pending_waits() {
        let session = Arc::new(session_with(&["a"]));
        let wait = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_mentions("a", 5_000).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.clear_all();
        assert!(wait.await.unwrap().unwrap().is_empty());
        assert!(session.get_all_agents(true).is_empty());
        assert_eq!(session.registered_agent_count(), 0);
    }

    #[test]
    fn debug_agents_are_hidden_unless_requested() {
        let session = session_with(&["a"]);
        let debug = session.register_debug_agent();
        assert_eq!(session.get_all_agents(false).len(), 1);
        assert!(session.get_all_agents(true).iter().any(|a| a.id == debug.id));
        assert_eq!(session.registered_agent_count(), 1);
    }

    #[test]
    fn extra_tools_come_from_the_graph() {
        let graph = AgentGraph::from_yaml_str(
            r#"
agents:
  a:
    type: local
    agent_type: echo
    extra_tools: [lookup]
tools:
  lookup:
    transport: { type: http, url: "http://localhost:9000" }
    schema: { name: lookup }
"#,
        )
        .unwrap();
        let session = Session::new("s", "app", "key", Some(graph), Vec::new());
        let agent = session.register_agent(AgentRegistration::new("a")).unwrap();
        assert_eq!(agent.extra_tools.len(), 1);
        assert_eq!(agent.extra_tools[0].schema.name, "lookup");
    }

    #[test]
    fn events_are_replayed_in_order() {
        let session = session_with(&["a"]);
        let thread = session.create_thread("t", "a", &[]).unwrap();
        session.send_message(&thread.id, "a", "x", vec![]).unwrap();

        let mut events = session.events();
        assert!(matches!(events.try_recv(), Ok(SessionEvent::AgentRegistered { .. })));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::ThreadCreated { .. })));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::MessageSent { .. })));
    }

    #[test]
    fn sender_colors_are_stable_and_in_range() {
        let session = session_with(&[]);
        let color = session.color_for_sender("planner");
        assert_eq!(color, session.color_for_sender("planner"));
        assert!(color < SENDER_COLORS);
    }
}
