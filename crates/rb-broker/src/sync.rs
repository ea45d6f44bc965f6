//! Cross-task signalling.
//!
//! Two channels with different audiences:
//! - the wake-up event: workers and the ticket-submission path poke the
//!   manager out of its timed wait. Signals coalesce; many `wake()` calls
//!   between two waits collapse into one wakeup.
//! - `resource_ready`: the manager announces which waiter's ticket just
//!   got a resource. Waiters subscribe and filter on their own id.

use std::time::Duration;

use tokio::sync::{broadcast, Notify};

pub struct Synchronizer {
    event: Notify,
    resource_ready: broadcast::Sender<String>,
}

impl Synchronizer {
    pub fn new() -> Self {
        let (resource_ready, _) = broadcast::channel(64);
        Self {
            event: Notify::new(),
            resource_ready,
        }
    }

    /// Wake the manager. Latches if nobody is waiting yet.
    pub fn wake(&self) {
        self.event.notify_one();
    }

    /// Block until woken or until `timeout` elapses, whichever is first.
    pub async fn wait_timeout(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.event.notified()).await;
    }

    /// Announce that the ticket owned by `tid` has a resource bound.
    pub fn notify_waiter(&self, tid: &str) {
        // Nobody listening is fine; the owner may poll instead of wait.
        let _ = self.resource_ready.send(tid.to_string());
    }

    pub fn subscribe_ready(&self) -> broadcast::Receiver<String> {
        self.resource_ready.subscribe()
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}
