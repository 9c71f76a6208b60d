//! # Broadcast Hub
//!
//! The viewer-facing side of the watch session. The hub owns the connection
//! registry, remembers the status line viewers are shown on arrival, and routes
//! retarget requests from viewers to the session task.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::core::error::WatchError;
use crate::core::normalizer::NormalizedEvent;
use crate::core::protocol::ViewerMessage;
use crate::core::registry::{ConnectionId, ConnectionRegistry, ViewerReceiver};
use crate::core::target::WatchTarget;
use crate::core::watch_session::SessionHandle;

/// Greeting queued to every viewer on join.
pub const WELCOME_MESSAGE: &str = "Connected to change stream relay";

/// A freshly joined viewer: its identity and its inbound message queue.
pub struct ViewerConnection {
    pub id: ConnectionId,
    pub receiver: ViewerReceiver,
}

pub struct BroadcastHub {
    registry: ConnectionRegistry,
    /// `Some` only while a subscription is active.
    status: Mutex<Option<String>>,
    locked: bool,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize, locked: bool) -> Self {
        Self {
            registry: ConnectionRegistry::new(queue_capacity),
            status: Mutex::new(None),
            locked,
        }
    }

    fn status(&self) -> MutexGuard<'_, Option<String>> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_status(&self) -> Option<String> {
        self.status().clone()
    }

    /// Registers a viewer and queues the welcome and, when watching, the
    /// current status.
    ///
    /// The status lock is held across registration so a concurrent
    /// `announce_status` lands either in the initial batch or after it.
    pub fn join(&self) -> ViewerConnection {
        let status = self.status();
        let mut initial = vec![ViewerMessage::welcome(WELCOME_MESSAGE)];
        if let Some(watching) = status.as_ref() {
            initial.push(ViewerMessage::status(watching.clone()));
        }
        let (id, receiver) = self.registry.register_with(initial);
        drop(status);

        info!(viewer = id, viewers = self.registry.len(), "viewer joined");
        ViewerConnection { id, receiver }
    }

    /// Idempotent.
    pub fn leave(&self, id: ConnectionId) {
        if self.registry.remove(id) {
            info!(viewer = id, viewers = self.registry.len(), "viewer left");
        }
    }

    /// Fans one normalized event out to every viewer.
    pub fn publish(&self, event: &NormalizedEvent) -> usize {
        let delivered = self.registry.deliver_all(ViewerMessage::change(event));
        debug!(
            operation = %event.operation.label(),
            namespace = %event.namespace,
            delivered,
            "change published"
        );
        delivered
    }

    /// Records the new status and broadcasts it.
    pub fn announce_status(&self, watching: &str) {
        let mut status = self.status();
        *status = Some(watching.to_string());
        let delivered = self.registry.deliver_all(ViewerMessage::status(watching));
        info!(watching, delivered, "status announced");
    }

    pub fn clear_status(&self) {
        self.status().take();
    }

    pub fn broadcast_error(&self, err: &WatchError) {
        self.registry.deliver_all(ViewerMessage::from(err));
    }

    pub fn send_to(&self, id: ConnectionId, message: ViewerMessage) -> bool {
        self.registry.deliver_to(id, message)
    }

    /// Releases every viewer; their sockets observe the queue closing.
    pub fn close_all(&self) -> usize {
        self.clear_status();
        self.registry.clear()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// # Retarget Request
    ///
    /// Locked relays answer the requester alone with an error. Otherwise the
    /// request joins the session's serialized queue and the outcome reaches
    /// every viewer as a `status` or `error` broadcast. Never waits: a full
    /// queue is answered to the requester with an error.
    pub fn handle_retarget_request(
        &self,
        session: &SessionHandle,
        id: ConnectionId,
        target: WatchTarget,
    ) -> Result<(), WatchError> {
        if self.locked {
            let err = WatchError::RetargetLocked(session.snapshot().target);
            warn!(viewer = id, requested = %target, "retarget rejected, target is fixed");
            self.send_to(id, ViewerMessage::from(&err));
            return Err(err);
        }

        info!(viewer = id, requested = %target, "retarget requested");
        if let Err(err) = session.request_retarget(target) {
            warn!(viewer = id, error = %err, "retarget request not queued");
            self.send_to(id, ViewerMessage::from(&err));
            return Err(err);
        }
        Ok(())
    }
}
