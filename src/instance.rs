// src/instance.rs
// Storage instance façade: binds the write engine, change publisher, and
// read paths to a named (database, collection) pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::changes::{ChangePublisher, EventBulk};
use crate::config::CollectionConfig;
use crate::document::{strip_engine_private, DocId, PrimaryKey};
use crate::engine::{self, BulkWriteResult};
use crate::error::{Result, StorageError};
use crate::logging;
use crate::query::{self, PreparedQuery};
use crate::storage::{Direction, Substrate, Table};
use crate::log_info;

/// `getChangedDocuments`'s return shape.
pub struct GetChangedDocumentsResult {
    pub changed_documents: HashMap<DocId, Value>,
    pub last_sequence: u64,
}

/// A per-collection storage instance: bulk write engine, change-feed
/// publisher, and read paths bound to one (database, collection) pair.
pub struct StorageInstance {
    database_name: String,
    collection_name: String,
    primary_key: PrimaryKey,
    substrate: Arc<dyn Substrate>,
    publisher: ChangePublisher,
    closed: AtomicBool,
}

impl StorageInstance {
    /// Open a collection's three tables through `substrate` and bind it
    /// to `config`'s (database, collection) pair.
    pub async fn open(config: CollectionConfig, substrate: Arc<dyn Substrate>) -> Result<Self> {
        logging::set_log_level(config.log_level);
        log_info!(
            "opening storage instance for {}/{}",
            config.database_name,
            config.collection_name
        );
        Ok(StorageInstance {
            database_name: config.database_name,
            collection_name: config.collection_name,
            primary_key: config.primary_key,
            substrate,
            publisher: ChangePublisher::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// `bulkWrite(rows) -> {success, error}`.
    pub async fn bulk_write(&self, rows: Vec<(Value, Option<Value>)>) -> Result<BulkWriteResult> {
        self.ensure_open()?;
        engine::bulk_write(self.substrate.as_ref(), &self.primary_key, &self.publisher, rows).await
    }

    /// `bulkAddRevisions(docs) -> void`.
    pub async fn bulk_add_revisions(&self, docs: Vec<Value>) -> Result<()> {
        self.ensure_open()?;
        engine::bulk_add_revisions(self.substrate.as_ref(), &self.primary_key, &self.publisher, docs).await
    }

    /// `findDocumentsById(ids, withDeleted) -> map`.
    pub async fn find_documents_by_id(
        &self,
        ids: &[DocId],
        with_deleted: bool,
    ) -> Result<HashMap<DocId, Value>> {
        self.ensure_open()?;

        let mut found = HashMap::with_capacity(ids.len());
        let live = self.substrate.bulk_get(Table::Live, ids).await?;
        let mut missing = Vec::new();
        for (id, doc) in ids.iter().zip(live.into_iter()) {
            match doc {
                Some(doc) => {
                    found.insert(id.clone(), strip_engine_private(&doc));
                }
                None => missing.push(id.clone()),
            }
        }

        if with_deleted && !missing.is_empty() {
            let deleted = self.substrate.bulk_get(Table::Deleted, &missing).await?;
            for (id, doc) in missing.into_iter().zip(deleted.into_iter()) {
                if let Some(doc) = doc {
                    found.insert(id, strip_engine_private(&doc));
                }
            }
        }

        Ok(found)
    }

    /// `query(preparedQuery) -> {documents}`.
    pub async fn query(&self, prepared: &PreparedQuery) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let live = self.substrate.scan_live().await?;
        let results = query::execute(prepared, live);
        Ok(results.iter().map(strip_engine_private).collect())
    }

    /// `getChangedDocuments({sinceSequence, direction, limit}) ->
    /// {changedDocuments, lastSequence}`.
    pub async fn get_changed_documents(
        &self,
        since_sequence: u64,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<GetChangedDocumentsResult> {
        self.ensure_open()?;

        let rows = engine::range_changes(self.substrate.as_ref(), since_sequence, direction, limit).await?;

        let last_sequence = match (direction, rows.first(), rows.last()) {
            (_, None, _) => since_sequence,
            (Direction::After, _, Some(last)) => last.sequence,
            (Direction::Before, Some(first), _) => first.sequence,
            _ => unreachable!(),
        };

        let ids: Vec<DocId> = rows.iter().map(|r| r.id.clone()).collect();
        let changed_documents = self.find_documents_by_id(&ids, true).await?;

        Ok(GetChangedDocumentsResult {
            changed_documents,
            last_sequence,
        })
    }

    /// `changeStream() -> subscribeable stream of EventBulk`.
    pub fn change_stream(&self) -> async_broadcast::Receiver<Arc<EventBulk>> {
        self.publisher.subscribe()
    }

    /// `remove() -> void`: clear `live` and `changes-meta`, then close.
    /// `deleted` is left for the substrate's own drop policy.
    pub async fn remove(&self) -> Result<()> {
        self.ensure_open()?;
        self.substrate.clear(Table::Live).await?;
        self.substrate.clear(Table::ChangesMeta).await?;
        self.close().await
    }

    /// `close() -> void`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log_info!(
            "closing storage instance for {}/{}",
            self.database_name,
            self.collection_name
        );
        self.publisher.close();
        Ok(())
    }

    /// `getAttachmentData(...)`: attachments are unsupported by this
    /// core.
    pub async fn get_attachment_data(&self, _id: &str, _attachment_id: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        Err(StorageError::Unsupported("attachments are not supported"))
    }
}
