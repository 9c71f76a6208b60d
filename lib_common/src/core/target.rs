//! # Watch Targets and Session State
//!
//! A `WatchTarget` names the scope the relay observes: the whole deployment,
//! one database ("container") or one collection ("resource") inside it.
//! `SessionState` is the bookkeeping the watch-session task keeps about its
//! single subscription; observers only ever see a `SessionSnapshot` copy.

use std::fmt;

use serde::Serialize;

/// Resource name that selects every resource of a container.
pub const ANY_RESOURCE: &str = "*";

/// The scope of observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// Every database in the deployment.
    #[default]
    EntireDeployment,
    /// Every collection of one database.
    OneContainer(String),
    /// A single collection.
    OneResource(String, String),
}

impl WatchTarget {
    /// Builds a target from the optional container/resource pair used by the
    /// viewer protocol and startup configuration.
    ///
    /// A missing or `*` container watches the deployment; a missing, empty or
    /// `*` resource watches the whole container.
    pub fn from_parts(container: Option<&str>, resource: Option<&str>) -> Self {
        let container = container.map(str::trim).filter(|c| !c.is_empty() && *c != ANY_RESOURCE);
        let resource = resource.map(str::trim).filter(|r| !r.is_empty() && *r != ANY_RESOURCE);

        match (container, resource) {
            (None, _) => WatchTarget::EntireDeployment,
            (Some(c), None) => WatchTarget::OneContainer(c.to_string()),
            (Some(c), Some(r)) => WatchTarget::OneResource(c.to_string(), r.to_string()),
        }
    }

    /// Container name, if the target is narrower than the deployment.
    pub fn container(&self) -> Option<&str> {
        match self {
            WatchTarget::EntireDeployment => None,
            WatchTarget::OneContainer(c) | WatchTarget::OneResource(c, _) => Some(c),
        }
    }

    /// Resource name, if the target is a single resource.
    pub fn resource(&self) -> Option<&str> {
        match self {
            WatchTarget::OneResource(_, r) => Some(r),
            _ => None,
        }
    }

    /// Human-readable description sent to viewers in `status` messages.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::EntireDeployment => write!(f, "entire deployment"),
            WatchTarget::OneContainer(c) => write!(f, "{}.{}", c, ANY_RESOURCE),
            WatchTarget::OneResource(c, r) => write!(f, "{}.{}", c, r),
        }
    }
}

impl Serialize for WatchTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Lifecycle phase of the watch session.
///
/// `Idle -> Connecting -> Watching -> (Error -> Connecting)`; a retarget moves
/// `Watching -> Connecting` and only shutdown returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Connecting,
    Watching,
    Error,
}

/// State owned exclusively by the watch-session task.
///
/// Generic over the subscription handle so the session can hold whichever
/// feed implementation it was built with.
#[derive(Debug)]
pub struct SessionState<S> {
    /// Last target a subscription was successfully opened against (or the
    /// startup target before the first success).
    pub current_target: WatchTarget,
    /// The one open subscription, if any.
    pub active_subscription: Option<S>,
    /// What viewers are told is being watched.
    pub status_description: String,
    /// Set when a fixed target was configured at startup.
    pub locked: bool,
    pub phase: SessionPhase,
}

impl<S> SessionState<S> {
    pub fn new(initial_target: WatchTarget, locked: bool) -> Self {
        Self {
            status_description: initial_target.describe(),
            current_target: initial_target,
            active_subscription: None,
            locked,
            phase: SessionPhase::Idle,
        }
    }

    /// A read-only copy for observers outside the session task.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            target: self.current_target.clone(),
            phase: self.phase,
            status: self.status_description.clone(),
            locked: self.locked,
            subscribed: self.active_subscription.is_some(),
        }
    }
}

/// Observer view of the session, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub target: WatchTarget,
    pub phase: SessionPhase,
    pub status: String,
    pub locked: bool,
    pub subscribed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_wildcards() {
        assert_eq!(WatchTarget::from_parts(None, None), WatchTarget::EntireDeployment);
        assert_eq!(WatchTarget::from_parts(Some("*"), Some("items")), WatchTarget::EntireDeployment);
        assert_eq!(
            WatchTarget::from_parts(Some("orders"), Some("*")),
            WatchTarget::OneContainer("orders".into())
        );
        assert_eq!(
            WatchTarget::from_parts(Some("orders"), Some("")),
            WatchTarget::OneContainer("orders".into())
        );
        assert_eq!(
            WatchTarget::from_parts(Some(" orders "), Some("items")),
            WatchTarget::OneResource("orders".into(), "items".into())
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(WatchTarget::EntireDeployment.describe(), "entire deployment");
        assert_eq!(WatchTarget::OneContainer("orders".into()).describe(), "orders.*");
        assert_eq!(
            WatchTarget::OneResource("orders".into(), "items".into()).describe(),
            "orders.items"
        );
    }

    #[test]
    fn test_value_equality_detects_same_target() {
        let a = WatchTarget::OneResource("orders".into(), "items".into());
        let b = WatchTarget::from_parts(Some("orders"), Some("items"));
        assert_eq!(a, b);
        assert_ne!(a, WatchTarget::OneContainer("orders".into()));
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let state: SessionState<()> = SessionState::new(WatchTarget::OneContainer("orders".into()), true);
        let snap = state.snapshot();
        assert_eq!(snap.status, "orders.*");
        assert_eq!(snap.phase, SessionPhase::Idle);
        assert!(snap.locked);
        assert!(!snap.subscribed);
    }
}
