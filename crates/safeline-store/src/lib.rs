//! # safeline-store
//!
//! Local backing store for the Safeline client.
//!
//! Documents live as JSON in an SQLite database (one table for every
//! collection, keyed by collection and id) next to a monotonic commit log
//! that drives live queries. Uploaded blobs live on the filesystem. Both
//! are exposed to the client through the async [`DocumentStore`] and
//! [`BlobStore`] traits so the core logic can run against fakes.

pub mod accounts;
pub mod blobs;
pub mod database;
pub mod document_store;
pub mod documents;
pub mod migrations;
pub mod models;
pub mod uploads;

mod error;

pub use blobs::{BlobStore, FsBlobStore};
pub use database::Database;
pub use document_store::{DocumentStore, SqliteDocumentStore};
pub use error::{Result, StoreError};
pub use models::*;
