//! MongoDB change streams as a `ChangeFeed`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use mongodb::bson::Document;
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use tracing::debug;

use crate::connections::MongoConnector;
use crate::core::error::WatchError;
use crate::core::normalizer::RawNotification;
use crate::core::target::WatchTarget;
use crate::feeds::{ChangeFeed, FeedOptions, Subscription};

pub struct MongoChangeFeed {
    connector: Arc<MongoConnector>,
}

impl MongoChangeFeed {
    pub fn new(connector: Arc<MongoConnector>) -> Self {
        Self { connector }
    }
}

fn stream_options(options: &FeedOptions) -> ChangeStreamOptions {
    ChangeStreamOptions::builder()
        .full_document(
            options
                .include_full_document_on_update
                .then_some(FullDocumentType::UpdateLookup),
        )
        .full_document_before_change(
            options
                .include_pre_image_when_available
                .then_some(FullDocumentBeforeChangeType::WhenAvailable),
        )
        .build()
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    type Subscription = MongoSubscription;

    async fn open(&self, target: &WatchTarget, options: &FeedOptions) -> Result<MongoSubscription, WatchError> {
        let client = self.connector.client().await?;
        let opts = stream_options(options);
        let failed = |e: mongodb::error::Error| WatchError::SubscriptionFailed {
            target: target.clone(),
            reason: e.to_string(),
        };

        // Raw documents keep every field and the server's field order.
        let stream = match target {
            WatchTarget::EntireDeployment => client
                .watch()
                .with_options(opts)
                .await
                .map_err(failed)?
                .with_type::<Document>(),
            WatchTarget::OneContainer(db) => client
                .database(db)
                .watch()
                .with_options(opts)
                .await
                .map_err(failed)?
                .with_type::<Document>(),
            WatchTarget::OneResource(db, coll) => client
                .database(db)
                .collection::<Document>(coll)
                .watch()
                .with_options(opts)
                .await
                .map_err(failed)?
                .with_type::<Document>(),
        };

        debug!(watch_target = %target, "mongodb change stream opened");
        Ok(MongoSubscription { stream })
    }
}

pub struct MongoSubscription {
    stream: ChangeStream<Document>,
}

#[async_trait]
impl Subscription for MongoSubscription {
    async fn next(&mut self) -> Option<Result<RawNotification, WatchError>> {
        self.stream.next().await.map(|item| {
            item.map(RawNotification::new)
                .map_err(|e| WatchError::StreamInterrupted(e.to_string()))
        })
    }

    async fn close(self) -> Result<(), WatchError> {
        // Dropping the stream kills the server-side cursor.
        drop(self.stream);
        Ok(())
    }
}
