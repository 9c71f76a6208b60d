//! # Connections Module
//!
//! Persistent connections to the document store and the discovery queries
//! that run over them.

/// MongoDB client management and database/collection discovery.
pub mod db_mongo;

pub use db_mongo::{DbError, MongoCatalog, MongoConnector};
