//! # MongoDB Connection Manager
//!
//! Holds one lazily built `mongodb::Client` and the discovery queries served
//! to viewers (database and collection listings).
//!
//! The client is created on first use, so an unreachable or misconfigured
//! store shows up as a retried connection failure instead of a startup crash.

use std::time::Duration;

use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::Client;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::core::error::WatchError;

/// Databases that never show up in listings.
pub const HIDDEN_CONTAINERS: [&str; 3] = ["admin", "local", "config"];

/// Collection prefix reserved by the server.
pub const SYSTEM_PREFIX: &str = "system.";

pub const DEFAULT_APP_NAME: &str = "change-stream-relay";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(String),
    #[error("Query execution failed: {0}")]
    QueryError(String),
}

impl From<DbError> for WatchError {
    fn from(err: DbError) -> Self {
        WatchError::ConnectionFailed(err.to_string())
    }
}

pub struct MongoConnector {
    uri: String,
    selection_timeout: Duration,
    client: OnceCell<Client>,
}

impl MongoConnector {
    /// # Arguments
    /// * `uri` - Connection string (e.g. "mongodb://localhost:27017/?replicaSet=rs0").
    /// * `selection_timeout` - How long the driver looks for a usable server.
    pub fn new(uri: impl Into<String>, selection_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            selection_timeout,
            client: OnceCell::new(),
        }
    }

    /// The shared client, built on first call. A failed build is retried on
    /// the next call.
    pub async fn client(&self) -> Result<&Client, DbError> {
        self.client
            .get_or_try_init(|| async {
                let mut options = ClientOptions::parse(&self.uri)
                    .await
                    .map_err(|e| DbError::ConnectionError(e.to_string()))?;
                options.app_name = Some(DEFAULT_APP_NAME.to_string());
                options.server_selection_timeout = Some(self.selection_timeout);

                let client = Client::with_options(options).map_err(|e| DbError::ConnectionError(e.to_string()))?;
                info!(app_name = DEFAULT_APP_NAME, "mongodb client created");
                Ok(client)
            })
            .await
    }

    /// Round-trips a `ping` to the deployment.
    pub async fn ping(&self) -> Result<(), DbError> {
        self.client()
            .await?
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

/// Read-only discovery of containers (databases) and resources (collections).
pub struct MongoCatalog {
    connector: std::sync::Arc<MongoConnector>,
    excluded: Vec<String>,
}

impl MongoCatalog {
    /// `excluded` entries hide a bare name or a qualified `container.resource`.
    pub fn new(connector: std::sync::Arc<MongoConnector>, excluded: Vec<String>) -> Self {
        Self { connector, excluded }
    }

    pub async fn list_containers(&self) -> Result<Vec<String>, DbError> {
        let names = self
            .connector
            .client()
            .await?
            .list_database_names()
            .await
            .map_err(|e| DbError::QueryError(e.to_string()))?;
        let visible = visible_containers(names, &self.excluded);
        debug!(count = visible.len(), "listed containers");
        Ok(visible)
    }

    pub async fn list_resources(&self, container: &str) -> Result<Vec<String>, DbError> {
        let names = self
            .connector
            .client()
            .await?
            .database(container)
            .list_collection_names()
            .await
            .map_err(|e| DbError::QueryError(e.to_string()))?;
        let visible = visible_resources(container, names, &self.excluded);
        debug!(container, count = visible.len(), "listed resources");
        Ok(visible)
    }
}

/// Sorted database names without server-internal and excluded ones.
pub fn visible_containers(names: Vec<String>, excluded: &[String]) -> Vec<String> {
    let mut visible: Vec<String> = names
        .into_iter()
        .filter(|name| !HIDDEN_CONTAINERS.contains(&name.as_str()))
        .filter(|name| !excluded.iter().any(|e| e == name))
        .collect();
    visible.sort();
    visible
}

/// Sorted collection names without `system.*` and excluded ones.
pub fn visible_resources(container: &str, names: Vec<String>, excluded: &[String]) -> Vec<String> {
    let mut visible: Vec<String> = names
        .into_iter()
        .filter(|name| !name.starts_with(SYSTEM_PREFIX))
        .filter(|name| {
            let qualified = format!("{}.{}", container, name);
            !excluded.iter().any(|e| *e == *name || *e == qualified)
        })
        .collect();
    visible.sort();
    visible
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_internal_databases_are_hidden() {
        let visible = visible_containers(names(&["orders", "admin", "local", "config", "audit"]), &names(&["audit"]));
        assert_eq!(visible, names(&["orders"]));
    }

    #[test]
    fn test_excluded_resources_match_bare_or_qualified() {
        let excluded = names(&["sessions", "orders.secrets", "billing.items"]);
        let visible = visible_resources(
            "orders",
            names(&["items", "system.views", "sessions", "secrets", "archive"]),
            &excluded,
        );
        assert_eq!(visible, names(&["archive", "items"]));
    }

    #[tokio::test]
    async fn test_bad_uri_is_a_connection_error() {
        let connector = MongoConnector::new("not-a-uri", Duration::from_millis(50));
        let err = connector.client().await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionError(_)));
        assert!(matches!(WatchError::from(err), WatchError::ConnectionFailed(_)));
    }
}
