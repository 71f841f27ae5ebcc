//! Count-based scheduler - wait until N agents have registered
//!
//! Used by the interactive dev mode, where an operator attaches agents by
//! hand and says up front how many to expect.

use std::collections::HashSet;
use tokio::sync::watch;

pub struct CountBasedScheduler {
    registered: watch::Sender<HashSet<String>>,
}

impl CountBasedScheduler {
    pub fn new() -> Self {
        let (registered, _) = watch::channel(HashSet::new());
        Self { registered }
    }

    /// Count an agent. Re-registering the same id does not count twice.
    pub fn register_agent(&self, agent_id: &str) {
        self.registered.send_modify(|set| {
            set.insert(agent_id.to_string());
        });
    }

    pub fn registered_count(&self) -> usize {
        self.registered.borrow().len()
    }

    /// Wait until at least `target` distinct agents have registered
    pub async fn wait_for_agent_count(&self, target: usize, timeout_ms: u64) -> bool {
        let mut rx = self.registered.subscribe();
        let wait = rx.wait_for(|present| present.len() >= target);
        matches!(
            tokio::time::timeout(super::millis(timeout_ms), wait).await,
            Ok(Ok(_))
        )
    }

    pub fn clear(&self) {
        self.registered.send_modify(|set| set.clear());
    }
}

impl Default for CountBasedScheduler {
    fn default() -> Self {
        Self::new()
    }
}
