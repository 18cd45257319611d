// src/storage/memory.rs
//! In-memory reference implementation of [`Substrate`].
//!
//! Fast, ephemeral, and behaviorally exact - this is what the engine's
//! own tests run against, and a fine substrate for any caller that does
//! not need durability across process restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::document::DocId;
use crate::error::Result;
use crate::storage::{ChangeLogEntry, Direction, Substrate, Table, TransactionGuard};

pub struct MemoryStorage {
    live: Mutex<HashMap<DocId, Value>>,
    deleted: Mutex<HashMap<DocId, Value>>,
    changes: Mutex<Vec<ChangeLogEntry>>,
    next_sequence: AtomicU64,
    tx_lock: Arc<AsyncMutex<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            live: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashMap::new()),
            changes: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            tx_lock: Arc::new(AsyncMutex::new(())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn table_map<'a>(
    storage: &'a MemoryStorage,
    table: Table,
) -> Option<&'a Mutex<HashMap<DocId, Value>>> {
    match table {
        Table::Live => Some(&storage.live),
        Table::Deleted => Some(&storage.deleted),
        Table::ChangesMeta => None,
    }
}

#[async_trait]
impl Substrate for MemoryStorage {
    async fn begin_transaction(&self) -> Result<TransactionGuard> {
        let permit = self.tx_lock.clone().lock_owned().await;
        Ok(TransactionGuard { _permit: permit })
    }

    async fn bulk_get(&self, table: Table, ids: &[DocId]) -> Result<Vec<Option<Value>>> {
        let Some(map) = table_map(self, table) else {
            return Ok(vec![None; ids.len()]);
        };
        let guard = map.lock();
        Ok(ids.iter().map(|id| guard.get(id).cloned()).collect())
    }

    async fn bulk_put(&self, table: Table, docs: Vec<(DocId, Value)>) -> Result<()> {
        let Some(map) = table_map(self, table) else {
            return Ok(());
        };
        let mut guard = map.lock();
        for (id, doc) in docs {
            guard.insert(id, doc);
        }
        Ok(())
    }

    async fn bulk_delete(&self, table: Table, ids: &[DocId]) -> Result<()> {
        let Some(map) = table_map(self, table) else {
            return Ok(());
        };
        let mut guard = map.lock();
        for id in ids {
            guard.remove(id);
        }
        Ok(())
    }

    async fn append_changes(&self, ids: &[DocId]) -> Result<()> {
        let mut guard = self.changes.lock();
        for id in ids {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            guard.push(ChangeLogEntry {
                sequence,
                id: id.clone(),
            });
        }
        Ok(())
    }

    async fn scan_live(&self) -> Result<Vec<Value>> {
        Ok(self.live.lock().values().cloned().collect())
    }

    async fn range_changes(
        &self,
        since_sequence: u64,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let guard = self.changes.lock();
        let mut rows: Vec<ChangeLogEntry> = match direction {
            Direction::After => guard
                .iter()
                .filter(|e| e.sequence > since_sequence)
                .cloned()
                .collect(),
            Direction::Before => guard
                .iter()
                .filter(|e| e.sequence < since_sequence)
                .cloned()
                .collect(),
        };
        match direction {
            Direction::After => rows.sort_by_key(|e| e.sequence),
            Direction::Before => rows.sort_by(|a, b| b.sequence.cmp(&a.sequence)),
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn clear(&self, table: Table) -> Result<()> {
        match table {
            Table::Live => self.live.lock().clear(),
            Table::Deleted => self.deleted.lock().clear(),
            Table::ChangesMeta => self.changes.lock().clear(),
        }
        Ok(())
    }
}
