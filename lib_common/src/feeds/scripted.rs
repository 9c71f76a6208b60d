//! Deterministic in-process change feed.
//!
//! The test side drives it: queue open failures or opens that never return,
//! emit notifications into the currently open subscription, interrupt or end
//! that subscription. The feed
//! records every open and close and the highest number of subscriptions that
//! were ever open at once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bson::Document;
use tokio::sync::mpsc;

use crate::core::error::WatchError;
use crate::core::normalizer::RawNotification;
use crate::core::target::WatchTarget;
use crate::feeds::{ChangeFeed, FeedOptions, Subscription};

type Item = Result<RawNotification, WatchError>;

#[derive(Default)]
struct Script {
    failures_left: usize,
    hangs_left: usize,
    opened: Vec<WatchTarget>,
    open_now: usize,
    max_open: usize,
    closes: usize,
    last_options: Option<FeedOptions>,
    active: Option<mpsc::UnboundedSender<Item>>,
}

#[derive(Clone, Default)]
pub struct ScriptedFeed {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` opens fail with `SubscriptionFailed`.
    pub fn fail_next_open(&self, n: usize) {
        self.script().failures_left = n;
    }

    /// The next `n` opens never complete.
    pub fn hang_next_open(&self, n: usize) {
        self.script().hangs_left = n;
    }

    /// Delivers one notification to the open subscription. `false` if none.
    pub fn emit(&self, document: Document) -> bool {
        self.push(Ok(RawNotification::new(document)))
    }

    /// Fails the open subscription with `StreamInterrupted`.
    pub fn interrupt(&self, reason: &str) -> bool {
        self.push(Err(WatchError::StreamInterrupted(reason.to_string())))
    }

    /// Ends the open subscription as if the server closed the cursor.
    pub fn end_stream(&self) -> bool {
        self.script().active.take().is_some()
    }

    fn push(&self, item: Item) -> bool {
        match self.script().active.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn opened_targets(&self) -> Vec<WatchTarget> {
        self.script().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.script().opened.len()
    }

    pub fn close_count(&self) -> usize {
        self.script().closes
    }

    /// Subscriptions currently open.
    pub fn open_now(&self) -> usize {
        self.script().open_now
    }

    /// Highest number of simultaneously open subscriptions ever observed.
    pub fn max_open(&self) -> usize {
        self.script().max_open
    }

    pub fn last_options(&self) -> Option<FeedOptions> {
        self.script().last_options
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    type Subscription = ScriptedSubscription;

    async fn open(&self, target: &WatchTarget, options: &FeedOptions) -> Result<ScriptedSubscription, WatchError> {
        let hang = {
            let mut script = self.script();
            script.opened.push(target.clone());
            script.last_options = Some(*options);
            let hang = script.hangs_left > 0;
            script.hangs_left = script.hangs_left.saturating_sub(1);
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut script = self.script();
        if script.failures_left > 0 {
            script.failures_left -= 1;
            return Err(WatchError::SubscriptionFailed {
                target: target.clone(),
                reason: "scripted failure".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        script.active = Some(tx);
        script.open_now += 1;
        script.max_open = script.max_open.max(script.open_now);

        Ok(ScriptedSubscription {
            rx,
            script: Arc::clone(&self.script),
        })
    }
}

pub struct ScriptedSubscription {
    rx: mpsc::UnboundedReceiver<Item>,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn next(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    async fn close(self) -> Result<(), WatchError> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.open_now = script.open_now.saturating_sub(1);
        script.closes += 1;
        Ok(())
    }
}
