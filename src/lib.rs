// src/lib.rs
// Core of a client-side document storage collection: bulk write engine,
// change-feed publisher, and the read paths built on top of an external
// key-value substrate.

pub mod categorizer;
pub mod changes;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod instance;
pub mod logging;
pub mod query;
pub mod revision;
pub mod storage;

pub use changes::{ChangeEvent, ChangePublisher, EventBulk, Operation};
pub use config::CollectionConfig;
pub use document::{DocId, PrimaryKey};
pub use engine::BulkWriteResult;
pub use error::{Result, StorageError};
pub use instance::{GetChangedDocumentsResult, StorageInstance};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use query::PreparedQuery;
pub use revision::Revision;
pub use storage::{ChangeLogEntry, Direction, MemoryStorage, Substrate, Table};
