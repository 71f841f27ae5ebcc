//! Replay-buffered publish/subscribe
//!
//! An `EventBus` is one logical stream: a session's debug events or one
//! agent's stdout/stderr. Subscribers that attach late first receive the most
//! recent `replay` events, then everything published afterwards, in order.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Lower bound for the live channel so a bus without replay still buffers
/// a burst for slow subscribers.
const MIN_CHANNEL_CAPACITY: usize = 64;

/// Event bus for one logical stream of events
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

struct BusInner<T> {
    sender: broadcast::Sender<T>,
    /// Most recent events, oldest first
    replay: Mutex<VecDeque<T>>,
    replay_capacity: usize,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus that replays up to `replay` past events to new subscribers
    pub fn new(replay: usize) -> Self {
        let (sender, _) = broadcast::channel(replay.max(MIN_CHANNEL_CAPACITY));
        Self {
            inner: Arc::new(BusInner {
                sender,
                replay: Mutex::new(VecDeque::with_capacity(replay)),
                replay_capacity: replay,
            }),
        }
    }

    /// Publish an event to all current subscribers and the replay buffer
    pub fn emit(&self, event: T) {
        // The replay lock is held across the send so that a concurrent
        // subscribe sees each event exactly once: either in its history
        // snapshot or on its live receiver.
        let mut replay = self.inner.replay.lock();
        if self.inner.replay_capacity > 0 {
            if replay.len() == self.inner.replay_capacity {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }

        let receiver_count = self.inner.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            trace!("No subscribers listening to event");
        }
    }

    /// Subscribe, starting with the replayed history
    pub fn subscribe(&self) -> BusReceiver<T> {
        let replay = self.inner.replay.lock();
        let history = replay.clone();
        let receiver = self.inner.sender.subscribe();
        BusReceiver { history, receiver }
    }

    /// Snapshot of the replay buffer, oldest first
    pub fn history(&self) -> Vec<T> {
        self.inner.replay.lock().iter().cloned().collect()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

/// Receiving side of an `EventBus`
pub struct BusReceiver<T> {
    history: VecDeque<T>,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> BusReceiver<T> {
    /// Receive the next event, waiting if none is available
    pub async fn recv(&mut self) -> Result<T, BusError> {
        if let Some(event) = self.history.pop_front() {
            return Ok(event);
        }
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => BusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                BusError::Lagged(n)
            }
        })
    }

    /// Receive an event without waiting
    pub fn try_recv(&mut self) -> Result<T, BusError> {
        if let Some(event) = self.history.pop_front() {
            return Ok(event);
        }
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => BusError::Empty,
            broadcast::error::TryRecvError::Closed => BusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                BusError::Lagged(n)
            }
        })
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
