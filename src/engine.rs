// src/engine.rs
// Bulk write engine: orchestrates the read-modify-write transaction
// around the pure categorizer and publishes the resulting bulk.

use std::collections::HashMap;

use serde_json::Value;

use crate::categorizer::{
    categorize_client_writes, categorize_remote_revisions, CategorizedWrites, RemoteWriteRow, WriteRow,
};
use crate::changes::{ChangePublisher, EventBulk};
use crate::document::{DocId, PrimaryKey};
use crate::error::{Result, StorageError};
use crate::storage::{Direction, Substrate, Table};
use crate::{log_debug, log_trace};

/// Result of `bulkWrite`: the accepted documents, and per-id conflicts.
pub struct BulkWriteResult {
    pub success: HashMap<DocId, Value>,
    pub error: HashMap<DocId, StorageError>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read the current stored state (`live`, falling back to `deleted`) for
/// every id in `ids`, preserving none of the input order beyond what the
/// returned map needs - callers index by id, not position.
async fn read_current_state(
    substrate: &dyn Substrate,
    ids: &[DocId],
) -> Result<HashMap<DocId, Value>> {
    let mut current = HashMap::with_capacity(ids.len());

    let live = substrate.bulk_get(Table::Live, ids).await?;
    let mut missing = Vec::new();
    for (id, doc) in ids.iter().zip(live.into_iter()) {
        match doc {
            Some(doc) => {
                current.insert(id.clone(), doc);
            }
            None => missing.push(id.clone()),
        }
    }

    if !missing.is_empty() {
        let deleted = substrate.bulk_get(Table::Deleted, &missing).await?;
        for (id, doc) in missing.into_iter().zip(deleted.into_iter()) {
            if let Some(doc) = doc {
                current.insert(id, doc);
            }
        }
    }

    Ok(current)
}

/// Execute the four bulk substrate mutations concurrently, append the
/// `changes-meta` rows if any id changed, and return once every mutation
/// has completed.
async fn apply_mutations(substrate: &dyn Substrate, categorized: &CategorizedWrites) -> Result<()> {
    let put_live = substrate.bulk_put(Table::Live, categorized.put_live.clone());
    let remove_live = substrate.bulk_delete(Table::Live, &categorized.remove_live);
    let put_deleted = substrate.bulk_put(Table::Deleted, categorized.put_deleted.clone());
    let remove_deleted = substrate.bulk_delete(Table::Deleted, &categorized.remove_deleted);

    let (put_live, remove_live, put_deleted, remove_deleted) =
        tokio::join!(put_live, remove_live, put_deleted, remove_deleted);
    put_live?;
    remove_live?;
    put_deleted?;
    remove_deleted?;

    if !categorized.change_ids.is_empty() {
        substrate.append_changes(&categorized.change_ids).await?;
    }

    Ok(())
}

/// Stamp `end_time` on every event and publish the bulk. Called while the
/// caller still holds its transaction guard, so a second bulk cannot begin
/// its own transaction and publish ahead of this one - commit order stays
/// equal to publication order. Publishing itself is still non-blocking
/// (`try_broadcast`): this only serializes publish calls relative to each
/// other, not the publish call against the change stream's readers.
fn publish(publisher: &ChangePublisher, mut categorized: CategorizedWrites) {
    let end_time = now_millis();
    for event in categorized.events.iter_mut() {
        event.end_time = end_time;
    }
    publisher.publish(EventBulk::new(categorized.events));
}

/// `bulkWrite(rows)` - categorize a batch of client writes against
/// current storage state, apply the accepted ones transactionally, and
/// publish the resulting bulk.
pub async fn bulk_write(
    substrate: &dyn Substrate,
    primary_key: &PrimaryKey,
    publisher: &ChangePublisher,
    rows: Vec<(Value, Option<Value>)>,
) -> Result<BulkWriteResult> {
    if rows.is_empty() {
        return Err(StorageError::EmptyBatch);
    }

    let mut ids = Vec::with_capacity(rows.len());
    for (doc, _) in &rows {
        let id = primary_key.extract(doc).ok_or_else(|| {
            StorageError::ShouldNotHappen(format!("write row does not resolve a primary key: {doc}"))
        })?;
        ids.push(id);
    }

    log_trace!("bulkWrite: acquiring transaction for {} row(s)", rows.len());
    let guard = substrate.begin_transaction().await?;

    let current = read_current_state(substrate, &ids).await?;

    let write_rows: Vec<WriteRow> = rows
        .into_iter()
        .map(|(document, previous)| WriteRow {
            document,
            previous,
            start_time: now_millis(),
        })
        .collect();

    let categorized = categorize_client_writes(primary_key, &current, write_rows)?;

    apply_mutations(substrate, &categorized).await?;

    let success = categorized.success.clone();
    let error = categorized
        .errors
        .iter()
        .map(|(id, err)| (id.clone(), err.to_lightweight_clone()))
        .collect();

    log_debug!(
        "bulkWrite committed: {} succeeded, {} conflicted",
        success.len(),
        error.len()
    );

    // Publish before releasing the transaction guard: a concurrent
    // bulkWrite/bulkAddRevisions blocked on begin_transaction() must not be
    // able to commit and publish ahead of this one.
    publish(publisher, categorized);
    drop(guard);

    Ok(BulkWriteResult { success, error })
}

/// `bulkAddRevisions(docs)` - apply remote revisions using
/// revision-ordering rules. Never returns per-id errors; losing
/// revisions are dropped silently.
pub async fn bulk_add_revisions(
    substrate: &dyn Substrate,
    primary_key: &PrimaryKey,
    publisher: &ChangePublisher,
    docs: Vec<Value>,
) -> Result<()> {
    if docs.is_empty() {
        return Err(StorageError::EmptyBatch);
    }

    let mut ids = Vec::with_capacity(docs.len());
    for doc in &docs {
        let id = primary_key.extract(doc).ok_or_else(|| {
            StorageError::ShouldNotHappen(format!("remote revision does not resolve a primary key: {doc}"))
        })?;
        ids.push(id);
    }

    log_trace!("bulkAddRevisions: acquiring transaction for {} doc(s)", docs.len());
    let guard = substrate.begin_transaction().await?;

    let current = read_current_state(substrate, &ids).await?;

    let remote_rows: Vec<RemoteWriteRow> = docs
        .into_iter()
        .map(|document| RemoteWriteRow {
            document,
            start_time: now_millis(),
        })
        .collect();

    let categorized = categorize_remote_revisions(primary_key, &current, remote_rows)?;

    apply_mutations(substrate, &categorized).await?;

    log_debug!(
        "bulkAddRevisions committed: {} event(s)",
        categorized.events.len()
    );

    // Publish before releasing the transaction guard - see bulk_write.
    publish(publisher, categorized);
    drop(guard);

    Ok(())
}

/// `getChangedDocuments` plumbing: translate a sequence-range query into
/// the substrate's `changes-meta` range scan. Document hydration happens
/// in the façade, which also knows how to strip engine-private fields.
pub async fn range_changes(
    substrate: &dyn Substrate,
    since_sequence: u64,
    direction: Direction,
    limit: Option<usize>,
) -> Result<Vec<crate::storage::ChangeLogEntry>> {
    substrate.range_changes(since_sequence, direction, limit).await
}

/// Helper so conflict errors can be duplicated into a fresh map without
/// requiring `StorageError: Clone` (it wraps `anyhow::Error`, which
/// isn't).
impl StorageError {
    fn to_lightweight_clone(&self) -> StorageError {
        match self {
            StorageError::Conflict {
                id,
                expected,
                actual,
            } => StorageError::Conflict {
                id: id.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            StorageError::EmptyBatch => StorageError::EmptyBatch,
            StorageError::ShouldNotHappen(msg) => StorageError::ShouldNotHappen(msg.clone()),
            StorageError::Unsupported(msg) => StorageError::Unsupported(msg),
            StorageError::Closed => StorageError::Closed,
            StorageError::InvalidRevision(rev) => StorageError::InvalidRevision(rev.clone()),
            StorageError::Substrate(err) => StorageError::ShouldNotHappen(err.to_string()),
            StorageError::Serialization(err) => StorageError::ShouldNotHappen(err.to_string()),
        }
    }
}
