//! One-shot wake-up slots for agents blocked on new messages
//!
//! Several waits may be outstanding for the same key; a wake completes all of
//! them and removes them. A waiter that times out removes only its own slot.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use super::model::Message;

pub(crate) struct Waiters<K> {
    next_token: AtomicU64,
    slots: DashMap<K, Vec<Slot>>,
}

struct Slot {
    token: u64,
    tx: oneshot::Sender<Message>,
}

/// A registered wait: its token and the receiving end of its slot
pub(crate) struct Registration {
    pub token: u64,
    pub rx: oneshot::Receiver<Message>,
}

impl<K: Eq + Hash + Clone> Waiters<K> {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(0),
            slots: DashMap::new(),
        }
    }

    pub fn register(&self, key: K) -> Registration {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.entry(key).or_default().push(Slot { token, tx });
        Registration { token, rx }
    }

    pub fn deregister(&self, key: &K, token: u64) {
        if let Some(mut slots) = self.slots.get_mut(key) {
            slots.retain(|slot| slot.token != token);
        }
        self.slots.remove_if(key, |_, slots| slots.is_empty());
    }

    /// Complete every wait registered under `key`. Returns how many woke.
    pub fn wake(&self, key: &K, message: &Message) -> usize {
        let Some((_, slots)) = self.slots.remove(key) else {
            return 0;
        };
        slots
            .into_iter()
            .filter(|slot| !slot.tx.is_closed())
            .filter_map(|slot| slot.tx.send(message.clone()).ok())
            .count()
    }

    /// Complete every wait whose key satisfies `matches`
    pub fn wake_matching(&self, matches: impl Fn(&K) -> bool, message: &Message) -> usize {
        let keys: Vec<K> = self
            .slots
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().map(|key| self.wake(key, message)).sum()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drop every slot; pending waits resolve as if they timed out
    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id: "m1".into(),
            thread_id: "t1".into(),
            sender_id: "a".into(),
            content: "hi".into(),
            mentions: vec![],
            timestamp: 0,
            position: 0,
        }
    }

    #[tokio::test]
    async fn wake_completes_all_waits_for_key() {
        let waiters = Waiters::new();
        let first = waiters.register("b".to_string());
        let second = waiters.register("b".to_string());

        assert_eq!(waiters.wake(&"b".to_string(), &message()), 2);
        assert_eq!(first.rx.await.unwrap().content, "hi");
        assert_eq!(second.rx.await.unwrap().content, "hi");
        assert_eq!(waiters.len(), 0);
    }

    #[test]
    fn deregister_removes_only_own_slot() {
        let waiters = Waiters::new();
        let first = waiters.register("b".to_string());
        let _second = waiters.register("b".to_string());

        waiters.deregister(&"b".to_string(), first.token);
        assert_eq!(waiters.len(), 1);
    }

    #[tokio::test]
    async fn cleared_waits_resolve_with_error() {
        let waiters = Waiters::new();
        let registration = waiters.register("b".to_string());
        waiters.clear();
        assert!(registration.rx.await.is_err());
    }
}
