//! # Viewer Connection Registry
//!
//! The registry is the set of live viewer channels. Each viewer gets a bounded
//! MPSC queue; the registry keeps the sending half and hands the receiving half
//! to the viewer's socket task.
//!
//! ## Delivery Rules:
//!
//! 1.  **Shared Fan-out**: Messages are wrapped in an `Arc` once and every viewer
//!     receives a pointer to the same allocation.
//! 2.  **Never Block**: Delivery uses `try_send`. A viewer whose queue is full or
//!     whose task has gone away is evicted on the spot; the other viewers are
//!     unaffected.
//! 3.  **No History**: A viewer only sees what is delivered after it registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::core::protocol::ViewerMessage;

/// Default capacity of a viewer's outbound queue.
pub const DEFAULT_VIEWER_QUEUE: usize = 256;

/// Identity of one registered viewer.
pub type ConnectionId = u64;

/// Receiving half handed to the viewer's socket task.
pub type ViewerReceiver = mpsc::Receiver<Arc<ViewerMessage>>;

struct ViewerHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<ViewerMessage>>,
}

/// Mutex-guarded collection of viewer channels.
pub struct ConnectionRegistry {
    viewers: Mutex<Vec<ViewerHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            viewers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn viewers(&self) -> MutexGuard<'_, Vec<ViewerHandle>> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Register
    ///
    /// Adds a viewer and queues `initial` messages to it before it becomes
    /// visible to `deliver_all`, so nothing broadcast concurrently can overtake
    /// them.
    pub fn register_with(&self, initial: Vec<ViewerMessage>) -> (ConnectionId, ViewerReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = self.queue_capacity.max(initial.len());
        let (tx, rx) = mpsc::channel(capacity);

        for message in initial {
            // Capacity covers the initial batch, and the receiver is still held here.
            let _ = tx.try_send(Arc::new(message));
        }

        let mut viewers = self.viewers();
        viewers.push(ViewerHandle { id, sender: tx });
        debug!(viewer = id, total = viewers.len(), "viewer registered");
        (id, rx)
    }

    pub fn register(&self) -> (ConnectionId, ViewerReceiver) {
        self.register_with(Vec::new())
    }

    /// Removes a viewer. Returns `false` when it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut viewers = self.viewers();
        let before = viewers.len();
        viewers.retain(|v| v.id != id);
        let removed = viewers.len() != before;
        if removed {
            debug!(viewer = id, total = viewers.len(), "viewer removed");
        }
        removed
    }

    /// # Deliver All
    ///
    /// Offers one shared message to every registered viewer and evicts the
    /// ones that cannot take it. Returns the number of viewers that accepted.
    pub fn deliver_all(&self, message: ViewerMessage) -> usize {
        let message = Arc::new(message);
        let mut viewers = self.viewers();

        viewers.retain(|viewer| match viewer.sender.try_send(Arc::clone(&message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(viewer = viewer.id, "viewer queue full, evicting slow viewer");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(viewer = viewer.id, "viewer channel closed, removing");
                false
            }
        });

        viewers.len()
    }

    /// Delivers to one viewer only. A viewer that cannot take it is evicted.
    pub fn deliver_to(&self, id: ConnectionId, message: ViewerMessage) -> bool {
        let mut viewers = self.viewers();
        let Some(pos) = viewers.iter().position(|v| v.id == id) else {
            return false;
        };

        match viewers[pos].sender.try_send(Arc::new(message)) {
            Ok(()) => true,
            Err(e) => {
                warn!(viewer = id, error = %e, "direct delivery failed, evicting viewer");
                viewers.remove(pos);
                false
            }
        }
    }

    /// Drops every sender. Viewer tasks observe their receiver closing.
    pub fn clear(&self) -> usize {
        let mut viewers = self.viewers();
        let released = viewers.len();
        viewers.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.viewers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.viewers().iter().any(|v| v.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(s: &str) -> ViewerMessage {
        ViewerMessage::status(s)
    }

    #[tokio::test]
    async fn test_deliver_all_reaches_every_viewer() {
        let registry = ConnectionRegistry::new(8);
        let (_a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        assert_eq!(registry.deliver_all(status("x")), 2);
        assert_eq!(*rx_a.recv().await.unwrap(), status("x"));
        assert_eq!(*rx_b.recv().await.unwrap(), status("x"));
    }

    #[tokio::test]
    async fn test_removed_viewer_receives_nothing() {
        let registry = ConnectionRegistry::new(8);
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        registry.deliver_all(status("x"));

        assert!(rx_a.recv().await.is_none());
        assert_eq!(*rx_b.recv().await.unwrap(), status("x"));
    }

    #[tokio::test]
    async fn test_slow_viewer_is_evicted_without_affecting_others() {
        let registry = ConnectionRegistry::new(1);
        let (slow, _rx_slow) = registry.register();
        let (fast, mut rx_fast) = registry.register();

        registry.deliver_all(status("1"));
        assert_eq!(*rx_fast.recv().await.unwrap(), status("1"));

        // `slow` never drains, so its single slot is still occupied.
        assert_eq!(registry.deliver_all(status("2")), 1);
        assert!(!registry.contains(slow));
        assert!(registry.contains(fast));
        assert_eq!(*rx_fast.recv().await.unwrap(), status("2"));
    }

    #[tokio::test]
    async fn test_closed_viewer_is_evicted() {
        let registry = ConnectionRegistry::new(4);
        let (gone, rx_gone) = registry.register();
        drop(rx_gone);

        assert_eq!(registry.deliver_all(status("x")), 0);
        assert!(!registry.contains(gone));
    }

    #[tokio::test]
    async fn test_initial_messages_come_first() {
        let registry = ConnectionRegistry::new(1);
        let (_id, mut rx) = registry.register_with(vec![ViewerMessage::welcome("hi"), status("orders.*")]);

        assert_eq!(*rx.recv().await.unwrap(), ViewerMessage::welcome("hi"));
        assert_eq!(*rx.recv().await.unwrap(), status("orders.*"));
    }

    #[tokio::test]
    async fn test_deliver_to_targets_one_viewer() {
        let registry = ConnectionRegistry::new(4);
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        assert!(registry.deliver_to(a, ViewerMessage::error("nope")));
        assert!(!registry.deliver_to(999, ViewerMessage::error("nope")));
        assert_eq!(*rx_a.recv().await.unwrap(), ViewerMessage::error("nope"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clear_closes_receivers() {
        let registry = ConnectionRegistry::new(4);
        let (_a, mut rx_a) = registry.register();
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert!(rx_a.recv().await.is_none());
    }
}
