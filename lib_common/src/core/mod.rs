//! # Core Relay Module
//!
//! The watch-session manager and everything it needs that does not touch a
//! real store or socket.
//!
//! ## Core Components:
//!
//! - **`target`**: what is being watched (`WatchTarget`) and the session's own
//!   bookkeeping (`SessionState`, `SessionSnapshot`).
//!
//! - **`normalizer`**: pure translation of one raw change notification into a
//!   display-ready `NormalizedEvent`.
//!
//! - **`protocol`**: the JSON frames exchanged with viewers.
//!
//! - **`registry`** and **`hub`**: the set of connected viewers and non-blocking
//!   fan-out to them.
//!
//! - **`watch_session`**: the single task that owns the upstream subscription,
//!   retargets it on request and reconnects after failures.

#![forbid(unsafe_code)]

/// Relay error taxonomy.
pub mod error;
/// Fan-out of events and status to viewers.
pub mod hub;
/// Raw notification to display-ready event.
pub mod normalizer;
/// Viewer wire messages.
pub mod protocol;
/// Viewer channel bookkeeping.
pub mod registry;
/// Watch targets and session state.
pub mod target;
/// The subscription-owning session task.
pub mod watch_session;

// --- Public API Re-exports ---
pub use error::WatchError;
pub use hub::{BroadcastHub, ViewerConnection, WELCOME_MESSAGE};
pub use normalizer::{normalize, NormalizedEvent, Operation, RawNotification};
pub use protocol::{ViewerMessage, ViewerRequest};
pub use registry::{ConnectionId, ConnectionRegistry, DEFAULT_VIEWER_QUEUE};
pub use target::{SessionPhase, SessionSnapshot, SessionState, WatchTarget};
pub use watch_session::{SessionConfig, SessionHandle, WatchSession};
