// End-to-end scenarios for the bulk write engine and change feed, run
// against the in-memory reference substrate.

use std::sync::Arc;

use docflow_core::{CollectionConfig, Direction, MemoryStorage, Operation, PrimaryKey, StorageInstance};
use serde_json::json;

async fn open_instance() -> StorageInstance {
    let config = CollectionConfig::new("testdb", "docs", PrimaryKey::Single("id".to_string()));
    StorageInstance::open(config, Arc::new(MemoryStorage::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn insert_then_conflict() {
    let instance = open_instance().await;

    let result = instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    assert!(result.error.is_empty());
    let stored_rev = result.success["a"]["_rev"].as_str().unwrap();
    assert!(stored_rev.starts_with("1-"));

    let result = instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    assert!(result.success.is_empty());
    assert!(result.error.contains_key("a"));
}

#[tokio::test]
async fn update_succeeds_with_matching_previous() {
    let instance = open_instance().await;
    let inserted = instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    let previous = inserted.success["a"].clone();

    let mut stream = instance.change_stream();

    let updated = instance
        .bulk_write(vec![(
            json!({"id": "a", "v": 2, "_deleted": false}),
            Some(previous),
        )])
        .await
        .unwrap();
    assert!(updated.error.is_empty());
    assert!(updated.success["a"]["_rev"].as_str().unwrap().starts_with("2-"));

    let bulk = stream.recv().await.unwrap();
    assert_eq!(bulk.events.len(), 1);
    assert_eq!(bulk.events[0].operation, Operation::Update);
    assert_eq!(bulk.events[0].previous.as_ref().unwrap()["v"], 1);
    assert_eq!(bulk.events[0].doc.as_ref().unwrap()["v"], 2);
}

#[tokio::test]
async fn delete_rewrites_previous_revision() {
    let instance = open_instance().await;
    let inserted = instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    let after_insert = inserted.success["a"].clone();

    let updated = instance
        .bulk_write(vec![(
            json!({"id": "a", "v": 2, "_deleted": false}),
            Some(after_insert),
        )])
        .await
        .unwrap();
    let after_update = updated.success["a"].clone();

    let deleted = instance
        .bulk_write(vec![(
            json!({"id": "a", "v": 2, "_deleted": true}),
            Some(after_update),
        )])
        .await
        .unwrap();
    assert!(deleted.error.is_empty());
    let stored = &deleted.success["a"];
    assert_eq!(stored["_deleted"], true);
    let new_rev = stored["_rev"].as_str().unwrap();
    assert!(new_rev.starts_with("3-"));

    let live = instance.find_documents_by_id(&["a".to_string()], false).await.unwrap();
    assert!(live.is_empty());
    let with_deleted = instance.find_documents_by_id(&["a".to_string()], true).await.unwrap();
    assert!(with_deleted.contains_key("a"));
}

#[tokio::test]
async fn resurrect_tombstone() {
    let instance = open_instance().await;
    instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    let v1 = instance.find_documents_by_id(&["a".to_string()], false).await.unwrap()["a"].clone();
    instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": true}), Some(v1))])
        .await
        .unwrap();

    let mut stream = instance.change_stream();

    let resurrected = instance
        .bulk_write(vec![(json!({"id": "a", "v": 3, "_deleted": false}), None)])
        .await
        .unwrap();
    assert!(resurrected.error.is_empty());

    let bulk = stream.recv().await.unwrap();
    assert_eq!(bulk.events.len(), 1);
    assert_eq!(bulk.events[0].operation, Operation::Insert);
    assert!(bulk.events[0].previous.is_none());

    let live = instance.find_documents_by_id(&["a".to_string()], false).await.unwrap();
    assert!(live.contains_key("a"));
    let deleted_only = instance.find_documents_by_id(&["a".to_string()], true).await.unwrap();
    assert_eq!(deleted_only["a"]["_deleted"], false);
}

#[tokio::test]
async fn bulk_add_revisions_drops_losing_revision_and_applies_winner() {
    let instance = open_instance().await;
    instance
        .bulk_add_revisions(vec![json!({"id": "a", "_deleted": false, "_rev": "3-hhhhhhhhhhhhhhhh"})])
        .await
        .unwrap();

    let mut stream = instance.change_stream();

    // Losing revision: dropped, no event.
    instance
        .bulk_add_revisions(vec![json!({"id": "a", "_deleted": false, "_rev": "2-zzzzzzzzzzzzzzzz"})])
        .await
        .unwrap();

    // Winning revision: applied, one event.
    instance
        .bulk_add_revisions(vec![json!({"id": "a", "_deleted": false, "_rev": "4-yyyyyyyyyyyyyyyy"})])
        .await
        .unwrap();

    let bulk = stream.recv().await.unwrap();
    assert_eq!(bulk.events.len(), 1);

    let docs = instance.find_documents_by_id(&["a".to_string()], true).await.unwrap();
    assert_eq!(docs["a"]["_rev"], "4-yyyyyyyyyyyyyyyy");
}

#[tokio::test]
async fn get_changed_documents_continuation() {
    let instance = open_instance().await;
    instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    let a = instance.find_documents_by_id(&["a".to_string()], false).await.unwrap()["a"].clone();
    instance
        .bulk_write(vec![(json!({"id": "a", "v": 2, "_deleted": false}), Some(a))])
        .await
        .unwrap();
    instance
        .bulk_write(vec![(json!({"id": "b", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();

    let first_page = instance
        .get_changed_documents(0, Direction::After, Some(2))
        .await
        .unwrap();
    assert_eq!(first_page.last_sequence, 2);
    assert_eq!(first_page.changed_documents.len(), 1); // both rows touch id "a"

    let second_page = instance
        .get_changed_documents(first_page.last_sequence, Direction::After, None)
        .await
        .unwrap();
    assert_eq!(second_page.last_sequence, 3);
    assert!(second_page.changed_documents.contains_key("b"));
}

#[tokio::test]
async fn inserting_an_already_deleted_document_still_appends_a_changes_row() {
    let instance = open_instance().await;

    let mut stream = instance.change_stream();

    let result = instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": true}), None)])
        .await
        .unwrap();
    assert!(result.error.is_empty());
    assert!(result.success["a"]["_deleted"].as_bool().unwrap());

    // No event is published for this row...
    instance
        .bulk_write(vec![(json!({"id": "b", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();
    let bulk = stream.recv().await.unwrap();
    assert_eq!(bulk.events.len(), 1);
    assert_eq!(bulk.events[0].id, "b");

    // ...but it still occupies sequence 1, ahead of "b"'s sequence 2, so
    // getChangedDocuments can still find it by sequence.
    let page = instance
        .get_changed_documents(0, Direction::After, None)
        .await
        .unwrap();
    assert_eq!(page.last_sequence, 2);
    assert!(page.changed_documents.contains_key("a"));
    assert!(page.changed_documents.contains_key("b"));
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let instance = open_instance().await;
    let err = instance.bulk_write(vec![]).await.unwrap_err();
    assert!(matches!(err, docflow_core::StorageError::EmptyBatch));
}

#[tokio::test]
async fn attachments_are_unsupported() {
    let instance = open_instance().await;
    let err = instance.get_attachment_data("a", "photo").await.unwrap_err();
    assert!(matches!(err, docflow_core::StorageError::Unsupported(_)));
}

#[tokio::test]
async fn operations_fail_after_close() {
    let instance = open_instance().await;
    instance.close().await.unwrap();
    // Idempotent.
    instance.close().await.unwrap();

    let err = instance
        .bulk_write(vec![(json!({"id": "a", "_deleted": false}), None)])
        .await
        .unwrap_err();
    assert!(matches!(err, docflow_core::StorageError::Closed));
}

#[tokio::test]
async fn remove_clears_live_and_changes_but_keeps_deleted_reachable_until_closed() {
    let instance = open_instance().await;
    instance
        .bulk_write(vec![(json!({"id": "a", "v": 1, "_deleted": false}), None)])
        .await
        .unwrap();

    instance.remove().await.unwrap();

    let err = instance.find_documents_by_id(&["a".to_string()], true).await.unwrap_err();
    assert!(matches!(err, docflow_core::StorageError::Closed));
}
