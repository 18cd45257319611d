// src/storage/mod.rs
//! Storage substrate abstraction.
//!
//! This module defines the interface the bulk write engine relies on to
//! talk to the physical key-value store. The physical store itself -
//! on-disk layout, WAL, compaction - is out of scope; this crate only
//! specifies the shape of the three named tables and a transaction
//! primitive that serializes writers across them.
//!
//! # Architecture
//!
//! ```text
//! Substrate trait (unified interface)
//!   └── MemoryStorage (reference implementation, used in tests)
//! ```

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::DocId;
use crate::error::Result;

pub use memory::MemoryStorage;

/// The three tables a collection's substrate partitions documents and
/// change metadata across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Live,
    Deleted,
    ChangesMeta,
}

/// Direction of a `changes-meta` range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    After,
    Before,
}

/// One row of the `changes-meta` log: `{sequence, id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub sequence: u64,
    pub id: DocId,
}

/// A held transaction permit. While alive, the substrate guarantees no
/// other `bulkWrite`/`bulkAddRevisions` transaction is interleaved.
/// Dropping it releases the permit; the engine drops it only after every
/// mutation in the batch has completed *and* the resulting bulk has been
/// published, so commit order and publication order always agree.
pub struct TransactionGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

/// Core storage abstraction the write engine and read paths are built
/// against. A production backend would persist `live`/`deleted` to disk
/// and `changes-meta` to an append-only log; this crate ships
/// [`MemoryStorage`] as the reference implementation used by tests and by
/// any caller that does not need persistence.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Acquire the named multi-table read-write transaction. Serializes
    /// with any other in-flight transaction on this instance.
    async fn begin_transaction(&self) -> Result<TransactionGuard>;

    /// `bulkGet`: look up `ids` in `table`, preserving input order. A
    /// missing id yields `None` at that position.
    async fn bulk_get(&self, table: Table, ids: &[DocId]) -> Result<Vec<Option<Value>>>;

    /// `bulkPut`: upsert documents into `table`, keyed by their `_id`
    /// field (already baked into the document's `id` by the caller).
    async fn bulk_put(&self, table: Table, docs: Vec<(DocId, Value)>) -> Result<()>;

    /// `bulkDelete`: remove `ids` from `table`, ignoring ids that are
    /// already absent.
    async fn bulk_delete(&self, table: Table, ids: &[DocId]) -> Result<()>;

    /// Append one `changes-meta` row per id, auto-assigning the next
    /// sequence number(s). Sequences are strictly increasing and
    /// gap-free.
    async fn append_changes(&self, ids: &[DocId]) -> Result<()>;

    /// Full scan of `live`, used by the unindexed `query()` path.
    async fn scan_live(&self) -> Result<Vec<Value>>;

    /// Range query over `changes-meta`'s sequence index.
    async fn range_changes(
        &self,
        since_sequence: u64,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>>;

    /// Clear every row of `table`.
    async fn clear(&self, table: Table) -> Result<()>;
}
