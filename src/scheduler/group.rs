//! Group scheduler - wait until a whole collaboration group has registered

use std::collections::HashSet;
use tokio::sync::watch;

/// Gate that releases an agent once every member of its startup group has
/// registered. Agents outside every group are never held back.
pub struct GroupScheduler {
    groups: Vec<HashSet<String>>,
    registered: watch::Sender<HashSet<String>>,
}

impl GroupScheduler {
    pub fn new(groups: Vec<HashSet<String>>) -> Self {
        let (registered, _) = watch::channel(HashSet::new());
        Self { groups, registered }
    }

    /// Record an agent as present and wake every waiter
    pub fn register_agent(&self, agent_id: &str) {
        self.registered.send_modify(|set| {
            set.insert(agent_id.to_string());
        });
    }

    /// The startup group containing `agent_id`, if any
    pub fn group_of(&self, agent_id: &str) -> Option<&HashSet<String>> {
        self.groups.iter().find(|group| group.contains(agent_id))
    }

    pub fn groups(&self) -> &[HashSet<String>] {
        &self.groups
    }

    /// Wait until every agent in `agent_id`'s group has registered.
    ///
    /// Returns `true` immediately for ungrouped agents, and `false` if the
    /// group is still incomplete when the timeout elapses.
    pub async fn wait_for_group(&self, agent_id: &str, timeout_ms: u64) -> bool {
        let Some(group) = self.group_of(agent_id) else {
            return true;
        };

        let mut rx = self.registered.subscribe();
        let wait = rx.wait_for(|present| group.iter().all(|member| present.contains(member)));
        matches!(
            tokio::time::timeout(super::millis(timeout_ms), wait).await,
            Ok(Ok(_))
        )
    }

    pub fn registered_count(&self) -> usize {
        self.registered.borrow().len()
    }

    /// Forget every registration
    pub fn clear(&self) {
        self.registered.send_modify(|set| set.clear());
    }
}
