//! Startup coordination gates
//!
//! Agents that collaborate tightly must all be connected before any of them
//! starts talking, otherwise the first mention can race the recipient's
//! registration. Both schedulers are plain in-memory state behind a `watch`
//! channel, so every waiter is woken when the registered set changes.

mod count;
mod group;

pub use count::CountBasedScheduler;
pub use group::GroupScheduler;

use std::time::Duration;

fn millis(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms)
}
