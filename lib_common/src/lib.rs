//! Shared library of the change-stream relay.
//!
//! Modules are gated by feature so the server pulls in the store driver while
//! tests of the core can stay driver-free.

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod feeds;

#[cfg(feature = "connections")]
pub mod connections;
