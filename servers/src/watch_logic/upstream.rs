use crate::watch_logic::config::Settings;
use lib_common::core::{BroadcastHub, SessionHandle, WatchSession};
use lib_common::feeds::ChangeFeed;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Starts the watch session on `feed`. The task ends after `cancel` fires and
/// the session has released its subscription and every viewer.
pub fn spawn<F: ChangeFeed>(
    feed: F,
    hub: Arc<BroadcastHub>,
    settings: &Settings,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let (session, handle) = WatchSession::new(feed, hub, settings.session_config(), cancel);
    info!(
        watch_target = %settings.initial_target,
        locked = settings.locked,
        "starting upstream watch session"
    );
    let task = tokio::spawn(async move {
        session.run().await;
        info!("upstream watch session finished");
    });
    (handle, task)
}
