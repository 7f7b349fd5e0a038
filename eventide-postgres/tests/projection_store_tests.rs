//! Document store and index state behaviour of the PostgreSQL backend.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use eventide::cqrs::{
    CqrsError, DocumentStore, FieldKind, FieldSpec, Filter, IndexDefinition, IndexStateStore,
    RebuildCheckpoint, StoredDocument,
};
use eventide::{IndexName, PartitionKey, Timestamp, WorkerId};
use eventide_postgres::PostgresProjectionStore;
use serde_json::json;

fn definition() -> IndexDefinition {
    IndexDefinition {
        name: IndexName::of("orders"),
        fields: vec![FieldSpec::new("status", FieldKind::String).filterable()],
    }
}

fn document(id: &str, partition: &str, status: &str) -> StoredDocument {
    StoredDocument {
        id: id.to_string(),
        partition_key: PartitionKey::try_new(partition).unwrap(),
        updated_at: Timestamp::now(),
        applied_versions: BTreeMap::new(),
        revision: 0,
        body: json!({ "status": status }),
    }
}

fn worker(name: &str) -> WorkerId {
    WorkerId::try_new(name).unwrap()
}

async fn store() -> PostgresProjectionStore {
    PostgresProjectionStore::from_pool(common::fresh_pool().await)
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn documents_require_an_ensured_index() {
    let store = store().await;
    let result = store
        .upsert(&IndexName::of("orders"), document("1", "p", "open"))
        .await;
    assert!(matches!(result, Err(CqrsError::InvalidSchema { .. })));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn documents_are_keyed_by_partition_and_id_and_filtered() {
    let store = store().await;
    let index = IndexName::of("orders");
    store.ensure_index(&definition()).await.unwrap();
    store.upsert(&index, document("1", "p", "open")).await.unwrap();
    store.upsert(&index, document("1", "q", "open")).await.unwrap();
    store.upsert(&index, document("2", "p", "closed")).await.unwrap();
    let p = PartitionKey::try_new("p").unwrap();
    let closed = store.get(&index, "2", &p).await.unwrap().unwrap();
    let shipped = StoredDocument {
        body: json!({ "status": "shipped" }),
        ..closed
    };
    assert_eq!(store.upsert(&index, shipped).await.unwrap(), 2);

    assert_eq!(store.count(&index).await.unwrap(), 3);
    let fetched = store.get(&index, "2", &p).await.unwrap().unwrap();
    assert_eq!(fetched.body["status"], "shipped");
    assert_eq!(fetched.revision, 2);

    let open = store
        .query(&index, None, &[Filter::eq("status", "open")])
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
    let open_in_p = store
        .query(&index, Some(&p), &[Filter::eq("status", "open")])
        .await
        .unwrap();
    assert_eq!(open_in_p.len(), 1);

    assert!(store.delete(&index, "1", &p).await.unwrap());
    assert!(!store.delete(&index, "1", &p).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn writes_based_on_a_stale_revision_are_rejected() {
    let store = store().await;
    let index = IndexName::of("orders");
    let p = PartitionKey::try_new("p").unwrap();
    store.ensure_index(&definition()).await.unwrap();
    store.upsert(&index, document("1", "p", "open")).await.unwrap();

    let first_read = store.get(&index, "1", &p).await.unwrap().unwrap();
    let second_read = first_read.clone();
    store
        .upsert(&index, StoredDocument { body: json!({ "status": "shipped" }), ..first_read })
        .await
        .unwrap();
    let stale = store
        .upsert(&index, StoredDocument { body: json!({ "status": "cancelled" }), ..second_read })
        .await;
    assert!(matches!(stale, Err(CqrsError::WriteConflict { ref id, .. }) if id == "1"));

    let duplicate_insert = store.upsert(&index, document("1", "p", "open")).await;
    assert!(matches!(duplicate_insert, Err(CqrsError::WriteConflict { .. })));
    let fetched = store.get(&index, "1", &p).await.unwrap().unwrap();
    assert_eq!(fetched.body["status"], "shipped");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn clearing_an_index_removes_only_its_documents() {
    let store = store().await;
    let orders = IndexName::of("orders");
    let archive = IndexDefinition {
        name: IndexName::of("archive"),
        ..definition()
    };
    store.ensure_index(&definition()).await.unwrap();
    store.ensure_index(&archive).await.unwrap();
    store.upsert(&orders, document("1", "p", "open")).await.unwrap();
    store.upsert(&orders, document("2", "q", "open")).await.unwrap();
    store.upsert(&archive.name, document("1", "p", "open")).await.unwrap();

    assert_eq!(store.clear_index(&orders).await.unwrap(), 2);
    assert_eq!(store.count(&orders).await.unwrap(), 0);
    assert_eq!(store.count(&archive.name).await.unwrap(), 1);
    store.upsert(&orders, document("1", "p", "open")).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn definitions_are_visible_to_other_store_instances() {
    let pool = common::fresh_pool().await;
    let writer = PostgresProjectionStore::from_pool(pool.clone());
    let reader = PostgresProjectionStore::from_pool(pool);
    writer.ensure_index(&definition()).await.unwrap();

    let loaded = reader
        .index_definition(&IndexName::of("orders"))
        .await
        .unwrap();
    assert_eq!(loaded, Some(definition()));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn only_one_of_many_racing_workers_acquires() {
    let store = store().await;
    store.register_index(&IndexName::of("orders")).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .acquire_and_lock_projection_that_requires_rebuild(
                    &worker(&format!("worker-{n}")),
                    Duration::from_secs(60),
                )
                .await
                .unwrap()
        }));
    }
    let mut acquired = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn lease_lifecycle_persists_checkpoints_and_fences_stale_holders() {
    let store = store().await;
    let index = IndexName::of("orders");
    store.register_index(&index).await.unwrap();

    let first = store
        .acquire_and_lock_projection_that_requires_rebuild(&worker("a"), Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let checkpoint = RebuildCheckpoint {
        total_events_to_process: 10,
        events_processed: 4,
        last_processed_event_timestamp: Some(Timestamp::now().truncated_to_micros()),
    };
    store.save_progress(&first, &checkpoint).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = store
        .acquire_and_lock_projection_that_requires_rebuild(&worker("b"), Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.reclaimed_from, Some(worker("a")));
    assert_eq!(
        second.status.last_processed_event_timestamp,
        checkpoint.last_processed_event_timestamp
    );

    let stale = store.complete_rebuild(&first).await;
    assert!(matches!(stale, Err(CqrsError::LeaseLost { .. })));

    let done = store.complete_rebuild(&second).await.unwrap();
    assert!(done.is_ready());
    assert!(!done.is_locked());

    let rearmed = store.request_rebuild(&index).await.unwrap();
    assert!(rearmed.requires_rebuild);
    assert!(rearmed.last_processed_event_timestamp.is_none());

    let state = store.index_state().await.unwrap();
    assert_eq!(state.statuses.len(), 1);
    assert_eq!(state.connection_id, "postgres");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires PostgreSQL: set TEST_DATABASE_URL or run Docker"]
async fn request_rebuild_of_unknown_index_fails() {
    let store = store().await;
    let result = store.request_rebuild(&IndexName::of("nope")).await;
    assert!(matches!(result, Err(CqrsError::UnknownIndex(_))));
}
