// src/config.rs
// Binds a storage instance to a named (database, collection) pair and
// carries the handful of settings a complete crate cannot hardcode.

use crate::document::PrimaryKey;
use crate::logging::LogLevel;

/// Configuration for opening a [`crate::instance::StorageInstance`].
pub struct CollectionConfig {
    pub database_name: String,
    pub collection_name: String,
    pub primary_key: PrimaryKey,
    pub log_level: LogLevel,
}

impl CollectionConfig {
    pub fn new(database_name: impl Into<String>, collection_name: impl Into<String>, primary_key: PrimaryKey) -> Self {
        CollectionConfig {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            primary_key,
            log_level: LogLevel::Warn,
        }
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}
