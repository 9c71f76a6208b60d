use lib_common::core::{SessionSnapshot, WatchTarget};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub session: SessionSnapshot,
    pub viewers: usize,
}

/// Presentation hints and lock state for viewer front ends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub default_format: String,
    pub default_layout: String,
    pub locked: bool,
    pub fixed_container: Option<String>,
    pub fixed_resource: Option<String>,
    pub watching: WatchTarget,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainersResponse {
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesResponse {
    pub container: String,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
