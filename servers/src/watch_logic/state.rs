use crate::watch_logic::config::Settings;
use anyhow::Result;
use async_trait::async_trait;
use lib_common::connections::MongoCatalog;
use lib_common::core::{BroadcastHub, SessionHandle};
use std::sync::Arc;

/// Read-only listing of what viewers may pick as a target.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn containers(&self) -> Result<Vec<String>>;
    async fn resources(&self, container: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl Catalog for MongoCatalog {
    async fn containers(&self) -> Result<Vec<String>> {
        Ok(self.list_containers().await?)
    }

    async fn resources(&self, container: &str) -> Result<Vec<String>> {
        Ok(self.list_resources(container).await?)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub session: SessionHandle,
    pub catalog: Arc<dyn Catalog>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(hub: Arc<BroadcastHub>, session: SessionHandle, catalog: Arc<dyn Catalog>, settings: Settings) -> Self {
        Self {
            hub,
            session,
            catalog,
            settings: Arc::new(settings),
        }
    }
}
