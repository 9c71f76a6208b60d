//! Change-stream relay server: configuration, logging, the upstream watch
//! session task and the downstream HTTP/WebSocket surface.

pub mod watch_logic;
