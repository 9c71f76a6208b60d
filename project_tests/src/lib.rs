//! Shared helpers for the integration suites under `tests/`.

use bson::{Document, doc};
use lib_common::core::registry::ViewerReceiver;
use lib_common::core::{
    BroadcastHub, SessionConfig, SessionHandle, SessionPhase, ViewerConnection, ViewerMessage, WatchSession,
    WatchTarget,
};
use lib_common::feeds::{FeedOptions, ScriptedFeed};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Retry delay used by the suites so reconnects happen quickly.
pub const FAST_RETRY: Duration = Duration::from_millis(10);
/// Upper bound for anything the suites wait on.
pub const WAIT: Duration = Duration::from_secs(3);

pub fn orders() -> WatchTarget {
    WatchTarget::OneContainer("orders".into())
}

pub fn orders_items() -> WatchTarget {
    WatchTarget::OneResource("orders".into(), "items".into())
}

pub fn fast_config(initial_target: WatchTarget, locked: bool) -> SessionConfig {
    SessionConfig {
        initial_target,
        locked,
        retry_delay: FAST_RETRY,
        open_timeout: Duration::from_millis(500),
        feed_options: FeedOptions::default(),
    }
}

pub fn insert(db: &str, coll: &str, full_document: Document) -> Document {
    doc! {
        "_id": { "_data": "826500" },
        "operationType": "insert",
        "ns": { "db": db, "coll": coll },
        "documentKey": { "_id": 1 },
        "fullDocument": full_document,
    }
}

/// A watch session over a `ScriptedFeed`. Viewers may join before `start`.
pub struct Harness {
    pub feed: ScriptedFeed,
    pub hub: Arc<BroadcastHub>,
    pub session: SessionHandle,
    pub cancel: CancellationToken,
    pending: Option<WatchSession<ScriptedFeed>>,
    task: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new(feed: ScriptedFeed, config: SessionConfig) -> Self {
        let hub = Arc::new(BroadcastHub::new(64, config.locked));
        let cancel = CancellationToken::new();
        let (session, handle) = WatchSession::new(feed.clone(), Arc::clone(&hub), config, cancel.clone());
        Self {
            feed,
            hub,
            session: handle,
            cancel,
            pending: Some(session),
            task: None,
        }
    }

    pub fn start(mut self) -> Self {
        if let Some(session) = self.pending.take() {
            self.task = Some(tokio::spawn(session.run()));
        }
        self
    }

    pub fn join(&self) -> ViewerConnection {
        self.hub.join()
    }

    pub async fn wait_for_phase(&self, phase: SessionPhase) {
        let mut rx = self.session.subscribe();
        timeout(WAIT, rx.wait_for(|s| s.phase == phase))
            .await
            .expect("session phase reached in time")
            .expect("session still running");
    }

    /// Cancels the session and waits for its teardown.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            timeout(WAIT, task)
                .await
                .expect("session stopped in time")
                .expect("session task");
        }
    }
}

pub async fn recv(rx: &mut ViewerReceiver) -> Arc<ViewerMessage> {
    timeout(WAIT, rx.recv())
        .await
        .expect("viewer message in time")
        .expect("viewer channel open")
}

/// Skips messages until one matches.
pub async fn recv_until(rx: &mut ViewerReceiver, pred: impl Fn(&ViewerMessage) -> bool) -> Arc<ViewerMessage> {
    loop {
        let msg = recv(rx).await;
        if pred(&msg) {
            return msg;
        }
    }
}

pub async fn recv_status(rx: &mut ViewerReceiver) -> String {
    let msg = recv_until(rx, |m| matches!(m, ViewerMessage::Status { .. })).await;
    match msg.as_ref() {
        ViewerMessage::Status { watching } => watching.clone(),
        other => panic!("expected status, got {other:?}"),
    }
}

/// True if nothing arrives within a short grace period.
pub async fn stays_quiet(rx: &mut ViewerReceiver) -> bool {
    timeout(Duration::from_millis(100), rx.recv()).await.is_err()
}
