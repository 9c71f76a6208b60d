//! # Watch Session
//!
//! The one task that owns the upstream subscription. Everything else talks to
//! it through a `SessionHandle` (serialized retarget requests), a
//! `CancellationToken` (shutdown) and a `watch` channel of `SessionSnapshot`s.
//!
//! ## Lifecycle
//!
//! The task runs an explicit step loop:
//!
//! - **Connect**: close the old subscription, then open one on the requested
//!   target within `open_timeout`. Success announces the new status; failure
//!   broadcasts an error and backs off.
//! - **Watch**: pump notifications through the normalizer to the hub while
//!   accepting retarget requests. A stream failure or end of stream closes the
//!   subscription and backs off.
//! - **Backoff**: wait `retry_delay`, then reconnect to the desired target. A
//!   retarget request arriving meanwhile replaces the pending retry.
//! - **Shutdown**: close the subscription, clear status, release viewers.
//!
//! Only one subscription is ever open because only this task opens or closes
//! them, and it always closes before opening.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::WatchError;
use crate::core::hub::BroadcastHub;
use crate::core::normalizer::{normalize, RawNotification};
use crate::core::target::{SessionPhase, SessionSnapshot, SessionState, WatchTarget};
use crate::feeds::{ChangeFeed, FeedOptions, Subscription};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_QUEUE: usize = 32;

type Reply = oneshot::Sender<Result<String, WatchError>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Watched at startup. When `locked`, the only target ever allowed.
    pub initial_target: WatchTarget,
    pub locked: bool,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub feed_options: FeedOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_target: WatchTarget::EntireDeployment,
            locked: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            feed_options: FeedOptions::default(),
        }
    }
}

enum SessionRequest {
    Retarget { target: WatchTarget, reply: Option<Reply> },
}

/// Cloneable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Retargets and waits for the outcome. Returns the new status line.
    ///
    /// Resolves to `RetargetSuperseded` when a later request replaces this
    /// one before the session acts on it.
    pub async fn retarget(&self, target: WatchTarget) -> Result<String, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.submit(target, Some(tx))?;
        rx.await.unwrap_or(Err(WatchError::Shutdown))
    }

    /// Queues a retarget without waiting; the outcome is broadcast to viewers.
    pub fn request_retarget(&self, target: WatchTarget) -> Result<(), WatchError> {
        self.submit(target, None)
    }

    fn submit(&self, target: WatchTarget, reply: Option<Reply>) -> Result<(), WatchError> {
        self.requests
            .try_send(SessionRequest::Retarget { target, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => WatchError::RetargetBusy,
                TrySendError::Closed(_) => WatchError::Shutdown,
            })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observer channel that changes on every phase or target transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

enum Step {
    Connect { target: WatchTarget, reply: Option<Reply> },
    Watch,
    Backoff,
    Shutdown,
}

enum Wake {
    Cancelled,
    Request(Option<SessionRequest>),
    Item(Option<Result<RawNotification, WatchError>>),
}

pub struct WatchSession<F: ChangeFeed> {
    feed: F,
    hub: Arc<BroadcastHub>,
    config: SessionConfig,
    cancel: CancellationToken,
    state: SessionState<F::Subscription>,
    /// Most recently requested target; what reconnects aim for.
    desired: WatchTarget,
    requests: mpsc::Receiver<SessionRequest>,
    requests_open: bool,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<F: ChangeFeed> WatchSession<F> {
    pub fn new(
        feed: F,
        hub: Arc<BroadcastHub>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> (Self, SessionHandle) {
        let state = SessionState::new(config.initial_target.clone(), config.locked);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);

        let session = Self {
            feed,
            hub,
            desired: config.initial_target.clone(),
            config,
            cancel,
            state,
            requests: rx,
            requests_open: true,
            snapshot_tx,
        };
        let handle = SessionHandle { requests: tx, snapshot: snapshot_rx };
        (session, handle)
    }

    /// Runs until the cancellation token fires.
    pub async fn run(mut self) {
        info!(
            watch_target = %self.desired,
            locked = self.state.locked,
            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
            "watch session started"
        );

        let mut step = Step::Connect { target: self.desired.clone(), reply: None };
        loop {
            step = match step {
                Step::Connect { target, reply } => self.connect(target, reply).await,
                Step::Watch => self.pump().await,
                Step::Backoff => self.backoff().await,
                Step::Shutdown => break,
            };
        }

        self.teardown().await;
    }

    async fn connect(&mut self, target: WatchTarget, reply: Option<Reply>) -> Step {
        self.close_active().await;
        self.desired = target.clone();
        self.set_phase(SessionPhase::Connecting);
        info!(watch_target = %target, "opening change stream");

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Shutdown,
            r = timeout(self.config.open_timeout, self.feed.open(&target, &self.config.feed_options)) => r,
        };
        let opened = opened.unwrap_or_else(|_| {
            Err(WatchError::SubscriptionFailed {
                target: target.clone(),
                reason: format!("open timed out after {} ms", self.config.open_timeout.as_millis()),
            })
        });

        match opened {
            Ok(subscription) => {
                let watching = target.describe();
                self.state.active_subscription = Some(subscription);
                self.state.current_target = target;
                self.state.status_description = watching.clone();
                self.hub.announce_status(&watching);
                self.set_phase(SessionPhase::Watching);
                info!(watching = %watching, "change stream open");

                if let Some(reply) = reply {
                    let _ = reply.send(Ok(watching));
                }
                Step::Watch
            }
            Err(err) => {
                error!(watch_target = %target, error = %err, "failed to open change stream");
                self.state.status_description = err.to_string();
                self.set_phase(SessionPhase::Error);
                self.hub.broadcast_error(&err);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                Step::Backoff
            }
        }
    }

    async fn pump(&mut self) -> Step {
        let wake = {
            let Some(subscription) = self.state.active_subscription.as_mut() else {
                return Step::Backoff;
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                req = self.requests.recv(), if self.requests_open => Wake::Request(req),
                item = subscription.next() => Wake::Item(item),
            }
        };

        match wake {
            Wake::Cancelled => Step::Shutdown,
            Wake::Request(req) => self.accept(req, Step::Watch),
            Wake::Item(Some(Ok(raw))) => {
                let event = normalize(&raw);
                self.hub.publish(&event);
                Step::Watch
            }
            Wake::Item(Some(Err(err))) => self.interrupted(err).await,
            Wake::Item(None) => {
                self.interrupted(WatchError::StreamInterrupted("change stream ended".into()))
                    .await
            }
        }
    }

    async fn interrupted(&mut self, err: WatchError) -> Step {
        warn!(watch_target = %self.state.current_target, error = %err, "change stream interrupted");
        self.hub.broadcast_error(&err);
        self.close_active().await;
        self.state.status_description = err.to_string();
        self.set_phase(SessionPhase::Error);
        Step::Backoff
    }

    async fn backoff(&mut self) -> Step {
        debug!(
            watch_target = %self.desired,
            delay_ms = self.config.retry_delay.as_millis() as u64,
            "waiting before reconnect"
        );
        let sleep = tokio::time::sleep(self.config.retry_delay);
        tokio::pin!(sleep);

        loop {
            let req = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Shutdown,
                req = self.requests.recv(), if self.requests_open => req,
                _ = &mut sleep => return Step::Connect { target: self.desired.clone(), reply: None },
            };

            let next = self.accept(req, Step::Backoff);
            if !matches!(next, Step::Backoff) {
                return next;
            }
        }
    }

    /// Turns a request into the next step, or `fallback` if it is refused.
    ///
    /// Requests already queued behind it are folded in: only the newest
    /// admitted target is opened and earlier waiters learn they were
    /// superseded.
    fn accept(&mut self, request: Option<SessionRequest>, fallback: Step) -> Step {
        let Some(SessionRequest::Retarget { target, reply }) = request else {
            debug!("all session handles dropped, no further retarget requests");
            self.requests_open = false;
            return fallback;
        };

        let mut pending = self.admit(target, reply);
        while let Ok(SessionRequest::Retarget { target, reply }) = self.requests.try_recv() {
            let Some(newer) = self.admit(target, reply) else {
                continue;
            };
            if let Some((stale, stale_reply)) = pending.take() {
                debug!(superseded = %stale, requested = %newer.0, "retarget request superseded");
                if let Some(stale_reply) = stale_reply {
                    let _ = stale_reply.send(Err(WatchError::RetargetSuperseded(newer.0.clone())));
                }
            }
            pending = Some(newer);
        }

        match pending {
            Some((target, reply)) => Step::Connect { target, reply },
            None => fallback,
        }
    }

    /// Refuses requests for another target while locked.
    fn admit(&self, target: WatchTarget, reply: Option<Reply>) -> Option<(WatchTarget, Option<Reply>)> {
        if self.state.locked && target != self.config.initial_target {
            let err = WatchError::RetargetLocked(self.config.initial_target.clone());
            warn!(requested = %target, "retarget refused, target is fixed");
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return None;
        }
        Some((target, reply))
    }

    async fn close_active(&mut self) {
        self.hub.clear_status();
        if let Some(subscription) = self.state.active_subscription.take() {
            self.publish_snapshot();
            match subscription.close().await {
                Ok(()) => debug!(watch_target = %self.state.current_target, "change stream closed"),
                Err(e) => warn!(watch_target = %self.state.current_target, error = %e, "error closing change stream"),
            }
        }
    }

    async fn teardown(&mut self) {
        self.close_active().await;
        self.requests.close();
        while self.requests.try_recv().is_ok() {}
        self.set_phase(SessionPhase::Idle);
        let released = self.hub.close_all();
        info!(released, "watch session stopped");
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.state.phase = phase;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }
}
