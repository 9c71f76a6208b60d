//! # Upstream Change Feeds
//!
//! A `ChangeFeed` opens subscriptions against a `WatchTarget`; a `Subscription`
//! yields raw notifications until it fails, ends or is closed. The watch
//! session is written against these traits only.
//!
//! - **`mongo_stream`**: MongoDB change streams (feature `connections`).
//! - **`scripted`**: a deterministic in-process feed for tests and demos.

use async_trait::async_trait;

use crate::core::error::WatchError;
use crate::core::normalizer::RawNotification;
use crate::core::target::WatchTarget;

#[cfg(feature = "connections")]
pub mod mongo_stream;
pub mod scripted;

#[cfg(feature = "connections")]
pub use mongo_stream::{MongoChangeFeed, MongoSubscription};
pub use scripted::{ScriptedFeed, ScriptedSubscription};

/// Options requested on every open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOptions {
    /// Ask the store to look up the post-image for updates.
    pub include_full_document_on_update: bool,
    /// Ask for the pre-image where the collection records one.
    pub include_pre_image_when_available: bool,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            include_full_document_on_update: true,
            include_pre_image_when_available: true,
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    type Subscription: Subscription;

    async fn open(&self, target: &WatchTarget, options: &FeedOptions) -> Result<Self::Subscription, WatchError>;
}

#[async_trait]
pub trait Subscription: Send + Sized + 'static {
    /// Next notification. `None` means the upstream ended the stream.
    async fn next(&mut self) -> Option<Result<RawNotification, WatchError>>;

    /// Releases the upstream cursor.
    async fn close(self) -> Result<(), WatchError>;
}
