//! Error taxonomy of the watch-session core.

use thiserror::Error;

use crate::core::target::WatchTarget;

/// Every failure the relay distinguishes.
///
/// Upstream failures (`ConnectionFailed`, `SubscriptionFailed`,
/// `StreamInterrupted`) are recoverable and drive the reconnect loop.
/// Viewer-facing failures (`RetargetLocked`, `RetargetBusy`,
/// `MalformedRequest`) are answered to the offending connection only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("cannot reach the document store: {0}")]
    ConnectionFailed(String),

    #[error("failed to open change stream on {target}: {reason}")]
    SubscriptionFailed { target: WatchTarget, reason: String },

    #[error("change stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("watch target is fixed to {0}; retarget requests are disabled")]
    RetargetLocked(WatchTarget),

    #[error("too many retarget requests pending; request dropped")]
    RetargetBusy,

    /// A newer request arrived before this one was acted on.
    #[error("retarget superseded by a later request for {0}")]
    RetargetSuperseded(WatchTarget),

    #[error("malformed viewer request: {0}")]
    MalformedRequest(String),

    #[error("watch session is shutting down")]
    Shutdown,
}
