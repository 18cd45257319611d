// src/categorizer.rs
// Pure write categorizer: given the current state of storage and a batch
// of write rows, decides where each document lands and what change
// events it produces. No I/O happens here - this is the part of the
// engine that is trivially unit-testable and trivially reviewable.

use std::collections::HashMap;

use serde_json::Value;

use crate::changes::{ChangeEvent, Operation};
use crate::document::{
    ensure_attachments, get_rev, is_deleted, set_deleted, set_last_write_at, set_rev, strip_engine_private,
    DocId, PrimaryKey,
};
use crate::error::{Result, StorageError};
use crate::revision::{first_revision, Revision};

/// One row of a client-initiated `bulkWrite` batch.
pub struct WriteRow {
    pub document: Value,
    pub previous: Option<Value>,
    /// Captured once per row by the engine; used as `$lastWriteAt` and
    /// `event.start_time`.
    pub start_time: i64,
}

/// One document of a `bulkAddRevisions` batch.
pub struct RemoteWriteRow {
    pub document: Value,
    pub start_time: i64,
}

/// Output of categorizing a batch against the current state: the four
/// bulk substrate mutations, the ids that need a `changes-meta` row, the
/// change events to publish, and per-id conflict errors (client writes
/// only).
#[derive(Default)]
pub struct CategorizedWrites {
    pub put_live: Vec<(DocId, Value)>,
    pub remove_live: Vec<DocId>,
    pub put_deleted: Vec<(DocId, Value)>,
    pub remove_deleted: Vec<DocId>,
    pub change_ids: Vec<DocId>,
    pub events: Vec<ChangeEvent>,
    pub errors: HashMap<DocId, StorageError>,
    /// The stored document for every accepted row, keyed by id -
    /// `bulkWrite`'s `success` return map.
    pub success: HashMap<DocId, Value>,
}

/// Prepare `doc` for storage: stamp `_deleted`, `$lastWriteAt`, and an
/// (empty) `_attachments` map.
fn finalize(mut doc: Value, rev: &Revision, deleted: bool, start_time: i64) -> Value {
    set_rev(&mut doc, rev);
    set_deleted(&mut doc, deleted);
    set_last_write_at(&mut doc, start_time);
    ensure_attachments(&mut doc);
    doc
}

/// Categorize a batch of client writes against the current storage
/// state. `current` holds, for every id touched by `rows`, the document
/// as it exists in `live` or `deleted` right now (absent if the id is
/// new).
pub fn categorize_client_writes(
    primary_key: &PrimaryKey,
    current: &HashMap<DocId, Value>,
    rows: Vec<WriteRow>,
) -> Result<CategorizedWrites> {
    let mut out = CategorizedWrites::default();

    for row in rows {
        let id = primary_key.extract(&row.document).ok_or_else(|| {
            StorageError::ShouldNotHappen(format!(
                "write row does not resolve a primary key: {row_doc}",
                row_doc = row.document
            ))
        })?;

        match current.get(&id) {
            None => {
                let new_deleted = is_deleted(&row.document);
                let rev = first_revision(&row.document);
                let stored = finalize(row.document, &rev, new_deleted, row.start_time);

                if new_deleted {
                    out.put_deleted.push((id.clone(), stored.clone()));
                    out.change_ids.push(id.clone());
                    // No event: an insert-already-deleted document is
                    // not observable by replicators, but it still gets a
                    // changes-meta row like every other accepted write.
                } else {
                    out.put_live.push((id.clone(), stored.clone()));
                    out.events.push(ChangeEvent {
                        id: id.clone(),
                        operation: Operation::Insert,
                        previous: None,
                        doc: Some(strip_engine_private(&stored)),
                        start_time: row.start_time,
                        end_time: row.start_time,
                    });
                    out.change_ids.push(id.clone());
                }
                out.success.insert(id.clone(), stored);
            }
            Some(existing) => {
                let existing_deleted = is_deleted(existing);
                let existing_rev_str = get_rev(existing);

                if !existing_deleted {
                    // existing, not-deleted: previous must be supplied and match.
                    let prev_rev = row.previous.as_ref().and_then(|p| get_rev(p));
                    if prev_rev.is_none() || prev_rev != existing_rev_str {
                        out.errors.insert(
                            id.clone(),
                            StorageError::Conflict {
                                id: id.clone(),
                                expected: prev_rev.map(str::to_string),
                                actual: existing_rev_str.unwrap_or("").to_string(),
                            },
                        );
                        continue;
                    }
                } else if let Some(previous) = row.previous.as_ref() {
                    // existing, deleted, previous supplied: must match.
                    let prev_rev = get_rev(previous);
                    if prev_rev != existing_rev_str {
                        out.errors.insert(
                            id.clone(),
                            StorageError::Conflict {
                                id: id.clone(),
                                expected: prev_rev.map(str::to_string),
                                actual: existing_rev_str.unwrap_or("").to_string(),
                            },
                        );
                        continue;
                    }
                }
                // existing, deleted, previous missing: treat previous := existing and continue.

                let current_rev = Revision::parse(existing_rev_str.ok_or_else(|| {
                    StorageError::ShouldNotHappen(format!("document '{id}' has no _rev"))
                })?)?;
                let new_deleted = is_deleted(&row.document);

                match (existing_deleted, new_deleted) {
                    (true, false) => {
                        // Resurrect: put live, remove from deleted.
                        let new_rev = current_rev.next(&row.document);
                        let stored = finalize(row.document, &new_rev, false, row.start_time);
                        out.put_live.push((id.clone(), stored.clone()));
                        out.remove_deleted.push(id.clone());
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Insert,
                            previous: None,
                            doc: Some(strip_engine_private(&stored)),
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (false, false) => {
                        // Update.
                        let new_rev = current_rev.next(&row.document);
                        let stored = finalize(row.document, &new_rev, false, row.start_time);
                        out.put_live.push((id.clone(), stored.clone()));
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Update,
                            previous: Some(strip_engine_private(existing)),
                            doc: Some(strip_engine_private(&stored)),
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (false, true) => {
                        // Delete: put deleted, remove from live. The
                        // attached `previous` carries the new tombstone
                        // revision, not the pre-delete one - this is what
                        // lets replicators apply the delete via
                        // `bulkAddRevisions` without reading `live` again.
                        let new_rev = current_rev.next(&row.document);
                        let stored = finalize(row.document, &new_rev, true, row.start_time);
                        out.put_deleted.push((id.clone(), stored.clone()));
                        out.remove_live.push(id.clone());
                        let mut previous_for_event = strip_engine_private(existing);
                        set_rev(&mut previous_for_event, &new_rev);
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Delete,
                            previous: Some(previous_for_event),
                            doc: None,
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (true, true) => {
                        // Tombstone -> tombstone via a client write matches
                        // no row of the categorization table.
                        return Err(StorageError::ShouldNotHappen(format!(
                            "write for already-deleted document '{id}' did not resolve to INSERT/UPDATE/DELETE"
                        )));
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Categorize a batch of remote revisions applied via `bulkAddRevisions`.
/// Never produces conflict errors: losing revisions are silently
/// dropped.
pub fn categorize_remote_revisions(
    primary_key: &PrimaryKey,
    current: &HashMap<DocId, Value>,
    rows: Vec<RemoteWriteRow>,
) -> Result<CategorizedWrites> {
    let mut out = CategorizedWrites::default();

    for row in rows {
        let id = primary_key.extract(&row.document).ok_or_else(|| {
            StorageError::ShouldNotHappen(format!(
                "remote revision does not resolve a primary key: {row_doc}",
                row_doc = row.document
            ))
        })?;
        let incoming_deleted = is_deleted(&row.document);
        let incoming_rev_str = get_rev(&row.document).ok_or_else(|| {
            StorageError::InvalidRevision(format!("remote document '{id}' carries no _rev"))
        })?;
        let incoming_rev = Revision::parse(incoming_rev_str)?;

        match current.get(&id) {
            None => {
                let mut stored = row.document.clone();
                set_last_write_at(&mut stored, row.start_time);
                ensure_attachments(&mut stored);
                if incoming_deleted {
                    out.put_deleted.push((id.clone(), stored.clone()));
                } else {
                    out.put_live.push((id.clone(), stored.clone()));
                }
                out.events.push(ChangeEvent {
                    id: id.clone(),
                    operation: Operation::Insert,
                    previous: None,
                    doc: Some(strip_engine_private(&stored)),
                    start_time: row.start_time,
                    end_time: row.start_time,
                });
                out.change_ids.push(id.clone());
                out.success.insert(id.clone(), stored);
            }
            Some(existing) => {
                let existing_rev_str = get_rev(existing).ok_or_else(|| {
                    StorageError::ShouldNotHappen(format!("document '{id}' has no _rev"))
                })?;
                let existing_rev = Revision::parse(existing_rev_str)?;

                if incoming_rev <= existing_rev {
                    // Losing revision: drop it, no error, no event.
                    continue;
                }

                let existing_deleted = is_deleted(existing);
                let mut stored = row.document.clone();
                set_last_write_at(&mut stored, row.start_time);
                ensure_attachments(&mut stored);

                match (existing_deleted, incoming_deleted) {
                    (true, false) => {
                        out.put_live.push((id.clone(), stored.clone()));
                        out.remove_deleted.push(id.clone());
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Insert,
                            previous: None,
                            doc: Some(strip_engine_private(&stored)),
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (false, false) => {
                        out.put_live.push((id.clone(), stored.clone()));
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Update,
                            previous: Some(strip_engine_private(existing)),
                            doc: Some(strip_engine_private(&stored)),
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (false, true) => {
                        out.put_deleted.push((id.clone(), stored.clone()));
                        out.remove_live.push(id.clone());
                        out.events.push(ChangeEvent {
                            id: id.clone(),
                            operation: Operation::Delete,
                            previous: Some(strip_engine_private(existing)),
                            doc: None,
                            start_time: row.start_time,
                            end_time: row.start_time,
                        });
                        out.change_ids.push(id.clone());
                        out.success.insert(id.clone(), stored);
                    }
                    (true, true) => {
                        // Update tombstone payload in place: applied, but
                        // no event and no changes-meta row.
                        out.put_deleted.push((id.clone(), stored.clone()));
                        out.success.insert(id.clone(), stored);
                    }
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pk() -> PrimaryKey {
        PrimaryKey::Single("id".to_string())
    }

    #[test]
    fn insert_into_empty_storage_emits_insert() {
        let current = HashMap::new();
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 1, "_deleted": false}),
            previous: None,
            start_time: 1000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert_eq!(out.put_live.len(), 1);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].operation, Operation::Insert);
        assert!(out.errors.is_empty());
        let stored_rev = get_rev(&out.success["a"]).unwrap();
        assert!(stored_rev.starts_with("1-"));
    }

    #[test]
    fn insert_of_already_deleted_document_appends_change_id_without_event() {
        let current = HashMap::new();
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 1, "_deleted": true}),
            previous: None,
            start_time: 1000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert_eq!(out.put_deleted.len(), 1);
        assert!(out.put_live.is_empty());
        assert!(out.events.is_empty());
        assert_eq!(out.change_ids, vec!["a".to_string()]);
        assert!(out.success.contains_key("a"));
    }

    #[test]
    fn reinsert_without_previous_conflicts() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "v": 1, "_deleted": false, "_rev": "1-aaa"}),
        );
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 1, "_deleted": false}),
            previous: None,
            start_time: 2000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert!(out.put_live.is_empty());
        assert!(out.errors.contains_key("a"));
    }

    #[test]
    fn update_with_matching_previous_increments_height() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "v": 1, "_deleted": false, "_rev": "1-aaa"}),
        );
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 2, "_deleted": false}),
            previous: Some(json!({"id": "a", "v": 1, "_rev": "1-aaa", "_deleted": false})),
            start_time: 2000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert_eq!(out.events[0].operation, Operation::Update);
        let new_rev = get_rev(&out.success["a"]).unwrap();
        assert!(new_rev.starts_with("2-"));
    }

    #[test]
    fn delete_rewrites_previous_revision() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "v": 2, "_deleted": false, "_rev": "2-bbb"}),
        );
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 2, "_deleted": true}),
            previous: Some(json!({"id": "a", "v": 2, "_rev": "2-bbb", "_deleted": false})),
            start_time: 3000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert_eq!(out.events[0].operation, Operation::Delete);
        let event_prev_rev = out.events[0]
            .previous
            .as_ref()
            .and_then(get_rev)
            .unwrap();
        let stored_rev = get_rev(&out.success["a"]).unwrap();
        assert_eq!(event_prev_rev, stored_rev);
        assert!(event_prev_rev.starts_with("3-"));
    }

    #[test]
    fn resurrect_tombstone_without_previous() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "v": 2, "_deleted": true, "_rev": "3-ccc"}),
        );
        let rows = vec![WriteRow {
            document: json!({"id": "a", "v": 3, "_deleted": false}),
            previous: None,
            start_time: 4000,
        }];
        let out = categorize_client_writes(&pk(), &current, rows).unwrap();
        assert_eq!(out.events[0].operation, Operation::Insert);
        assert!(out.events[0].previous.is_none());
        assert_eq!(out.remove_deleted, vec!["a".to_string()]);
    }

    #[test]
    fn losing_remote_revision_is_dropped() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "_deleted": false, "_rev": "3-hhh"}),
        );
        let rows = vec![RemoteWriteRow {
            document: json!({"id": "a", "_deleted": false, "_rev": "2-zzz"}),
            start_time: 1,
        }];
        let out = categorize_remote_revisions(&pk(), &current, rows).unwrap();
        assert!(out.events.is_empty());
        assert!(out.put_live.is_empty());
    }

    #[test]
    fn winning_remote_revision_is_applied() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "_deleted": false, "_rev": "3-hhh"}),
        );
        let rows = vec![RemoteWriteRow {
            document: json!({"id": "a", "_deleted": false, "_rev": "4-yyy"}),
            start_time: 1,
        }];
        let out = categorize_remote_revisions(&pk(), &current, rows).unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].operation, Operation::Update);
    }

    #[test]
    fn tombstone_to_tombstone_remote_update_emits_no_event() {
        let mut current = HashMap::new();
        current.insert(
            "a".to_string(),
            json!({"id": "a", "_deleted": true, "_rev": "3-hhh"}),
        );
        let rows = vec![RemoteWriteRow {
            document: json!({"id": "a", "_deleted": true, "_rev": "4-yyy"}),
            start_time: 1,
        }];
        let out = categorize_remote_revisions(&pk(), &current, rows).unwrap();
        assert!(out.events.is_empty());
        assert!(out.change_ids.is_empty());
        assert_eq!(out.put_deleted.len(), 1);
    }
}
