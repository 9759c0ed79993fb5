mod support;

use larder_storage::{ActionStatus, HttpMethod, Operation, RecordKey, StorageError, StoreSchema};
use larder_sync::{EngineConfig, EntityConfig, EntityStorage, OfflineEngine, SyncError};
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{engine, InventoryItem};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn inventory(engine: &OfflineEngine) -> EntityStorage<InventoryItem> {
    engine.entity(EntityConfig::inventory_items()).unwrap()
}

/// Loads two server records into the local store, then leaves connectivity as requested.
async fn seed(server: &MockServer, engine: &OfflineEngine, online_after: bool) {
    Mock::given(method("GET"))
        .and(path("/api/inventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "Salt", "qty": 10},
            {"id": 2, "name": "Flour", "qty": 5}
        ])))
        .mount(server)
        .await;
    inventory(engine).get_all().await.unwrap();
    engine.set_online(online_after);
}

// --- Create ---

#[tokio::test]
async fn online_create_adopts_server_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inventory"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42, "name": "Salt", "qty": 10})))
        .expect(1)
        .mount(&server)
        .await;
    let engine = engine(&server, true);
    let items = inventory(&engine);

    let record = items.create(InventoryItem::new("Salt", 10)).await.unwrap();
    assert_eq!(record.id, RecordKey::Int(42));
    assert!(!record.pending_sync);
    assert!(!record.offline);

    let local = engine.store().get_all("inventory_items").unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0]["id"], 42);
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn offline_create_queues_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    let engine = engine(&server, false);
    let items = inventory(&engine);

    let record = items.create(InventoryItem::new("Salt", 10)).await.unwrap();
    assert!(record.is_temporary());
    assert!(record.offline);
    assert!(record.pending_sync);

    let actions = engine.store().get_pending_actions().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].operation, Operation::Create);
    assert_eq!(actions[0].method, HttpMethod::Post);
    assert_eq!(actions[0].endpoint, "/api/inventory");
    assert_eq!(actions[0].record_id, record.id);
    assert_eq!(actions[0].data, json!({"name": "Salt", "qty": 10}));
}

#[tokio::test]
async fn failed_create_falls_back_to_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inventory"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let engine = engine(&server, true);

    let record = inventory(&engine).create(InventoryItem::new("Salt", 10)).await.unwrap();
    assert!(record.is_temporary());
    assert!(record.pending_sync);
    assert_eq!(engine.pending_sync_count().unwrap(), 1);

    let stored = engine.store().get_by_id("inventory_items", &record.id).unwrap().unwrap();
    assert_eq!(stored["_pending_sync"], true);
    assert_eq!(stored["_offline"], true);
}

#[tokio::test]
async fn create_reply_without_id_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    let engine = engine(&server, true);

    let err = inventory(&engine).create(InventoryItem::new("Salt", 10)).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidResponse(_)));
    assert_eq!(engine.store().count("inventory_items").unwrap(), 0);
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

// --- Reads ---

#[tokio::test]
async fn get_all_online_refreshes_local_copy() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, true).await;

    assert_eq!(engine.store().count("inventory_items").unwrap(), 2);
    engine.set_online(false);
    let local = inventory(&engine).get_all().await.unwrap();
    let names: Vec<_> = local.iter().map(|r| r.data.name.as_str()).collect();
    assert_eq!(names, vec!["Salt", "Flour"]);
}

#[tokio::test]
async fn get_all_falls_back_when_server_fails() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, true).await;
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/api/inventory"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let records = inventory(&engine).get_all().await.unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn get_all_keeps_records_with_pending_work() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;
    let items = inventory(&engine);
    items.update(&RecordKey::Int(1), json!({"qty": 3})).await.unwrap();

    engine.set_online(true);
    let served = items.get_all().await.unwrap();
    assert_eq!(served[0].data.qty, 10);

    let stored = engine.store().get_by_id("inventory_items", &RecordKey::Int(1)).unwrap().unwrap();
    assert_eq!(stored["qty"], 3);
    assert_eq!(stored["_pending_sync"], true);
}

#[tokio::test]
async fn get_by_id_offline_reads_local() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;

    let items = inventory(&engine);
    let record = items.get_by_id(&RecordKey::Int(2)).await.unwrap().unwrap();
    assert_eq!(record.data, InventoryItem::new("Flour", 5));
    assert!(items.get_by_id(&RecordKey::Int(99)).await.unwrap().is_none());
}

#[tokio::test]
async fn get_by_id_online_uses_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/inventory/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5, "name": "Yeast", "qty": 2})))
        .mount(&server)
        .await;
    let engine = engine(&server, true);

    let record = inventory(&engine).get_by_id(&RecordKey::Int(5)).await.unwrap().unwrap();
    assert_eq!(record.data.name, "Yeast");
    assert!(engine.store().get_by_id("inventory_items", &RecordKey::Int(5)).unwrap().is_some());
}

#[tokio::test]
async fn search_filters_client_side() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;

    let low = inventory(&engine).search(|r| r.data.qty < 8).await.unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].data.name, "Flour");
}

#[tokio::test]
async fn refresh_offline_does_not_fall_back() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;

    let err = inventory(&engine).refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::UnavailableOffline(_)));
}

// --- Update ---

#[tokio::test]
async fn update_missing_record_is_not_found() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    let err = inventory(&engine)
        .update(&RecordKey::Int(7), json!({"qty": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn offline_update_merges_and_queues_put() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;

    let record = inventory(&engine)
        .update(&RecordKey::Int(1), json!({"qty": 4, "_pending_sync": false}))
        .await
        .unwrap();
    assert_eq!(record.data, InventoryItem::new("Salt", 4));
    assert!(record.pending_sync);

    let actions = engine.store().get_pending_actions().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].operation, Operation::Update);
    assert_eq!(actions[0].method, HttpMethod::Put);
    assert_eq!(actions[0].endpoint, "/api/inventory/1");
    assert_eq!(actions[0].data, json!({"name": "Salt", "qty": 4}));
}

#[tokio::test]
async fn online_update_puts_to_server() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, true).await;
    Mock::given(method("PUT"))
        .and(path("/api/inventory/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 2, "name": "Flour", "qty": 9})))
        .expect(1)
        .mount(&server)
        .await;

    let record = inventory(&engine)
        .update(&RecordKey::Int(2), json!({"qty": 9}))
        .await
        .unwrap();
    assert_eq!(record.data.qty, 9);
    assert!(!record.pending_sync);
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn update_of_temporary_record_queues_behind_create() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let engine = engine(&server, false);
    let items = inventory(&engine);
    let created = items.create(InventoryItem::new("Salt", 10)).await.unwrap();

    engine.set_online(true);
    let updated = items.update(&created.id, json!({"qty": 6})).await.unwrap();
    assert_eq!(updated.id, created.id);
    assert!(updated.pending_sync);

    let actions = engine.store().get_all_actions().unwrap();
    let ops: Vec<_> = actions.iter().map(|a| a.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update]);
}

// --- Delete ---

#[tokio::test]
async fn online_delete_removes_record() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, true).await;
    Mock::given(method("DELETE"))
        .and(path("/api/inventory/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    inventory(&engine).delete(&RecordKey::Int(1)).await.unwrap();
    assert!(engine.store().get_by_id("inventory_items", &RecordKey::Int(1)).unwrap().is_none());
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn delete_of_record_already_gone_on_server() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, true).await;
    Mock::given(method("DELETE"))
        .and(path("/api/inventory/2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    inventory(&engine).delete(&RecordKey::Int(2)).await.unwrap();
    assert_eq!(engine.store().count("inventory_items").unwrap(), 1);
    assert_eq!(engine.pending_sync_count().unwrap(), 0);
}

#[tokio::test]
async fn offline_delete_soft_deletes_and_queues() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;
    let items = inventory(&engine);

    items.delete(&RecordKey::Int(1)).await.unwrap();

    let stored = engine.store().get_by_id("inventory_items", &RecordKey::Int(1)).unwrap().unwrap();
    assert_eq!(stored["_deleted"], true);
    assert_eq!(stored["_offline"], true);
    assert_eq!(stored["_pending_sync"], true);

    let visible = items.get_all().await.unwrap();
    assert_eq!(visible.len(), 1);
    assert!(items.get_by_id(&RecordKey::Int(1)).await.unwrap().is_none());

    let actions = engine.store().get_pending_actions().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].method, HttpMethod::Delete);
    assert_eq!(actions[0].endpoint, "/api/inventory/1");
}

#[tokio::test]
async fn update_after_soft_delete_is_rejected() {
    let server = MockServer::start().await;
    let engine = engine(&server, true);
    seed(&server, &engine, false).await;
    let items = inventory(&engine);
    items.delete(&RecordKey::Int(1)).await.unwrap();

    let err = items.update(&RecordKey::Int(1), json!({"qty": 1})).await.unwrap_err();
    assert!(matches!(err, SyncError::RecordDeleted(_)));
    assert_eq!(engine.pending_sync_count().unwrap(), 1);

    // A second delete is a no-op.
    items.delete(&RecordKey::Int(1)).await.unwrap();
    assert_eq!(engine.pending_sync_count().unwrap(), 1);
}

#[tokio::test]
async fn offline_delete_of_unknown_record_is_not_found() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    let err = inventory(&engine).delete(&RecordKey::Int(3)).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

// --- Bookkeeping ---

#[tokio::test]
async fn pending_count_is_per_entity_type() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    let items = inventory(&engine);
    let suppliers: EntityStorage<serde_json::Value> = engine.entity(EntityConfig::suppliers()).unwrap();

    items.create(InventoryItem::new("Salt", 10)).await.unwrap();
    items.create(InventoryItem::new("Flour", 5)).await.unwrap();
    suppliers.create(json!({"name": "Metro"})).await.unwrap();

    assert_eq!(items.pending_count().unwrap(), 2);
    assert_eq!(suppliers.pending_count().unwrap(), 1);
    assert_eq!(engine.pending_sync_count().unwrap(), 3);

    let statuses: Vec<_> = engine.store().get_all_actions().unwrap().iter().map(|a| a.status).collect();
    assert!(statuses.iter().all(|s| *s == ActionStatus::Pending));
}

#[tokio::test]
async fn entity_requires_declared_partition() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    let result = engine.entity::<InventoryItem>(EntityConfig::new("widget", "widgets", "/api/widgets"));
    assert!(matches!(
        result.err().unwrap(),
        SyncError::Storage(StorageError::UnknownPartition(_))
    ));
}

#[tokio::test]
async fn queued_work_survives_restart() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        database_path: Some(dir.path().join("larder.db")),
        ..support::test_config(&server)
    };

    let temp_id = {
        let engine = OfflineEngine::new(config.clone(), StoreSchema::restaurant(), false).unwrap();
        inventory(&engine).create(InventoryItem::new("Salt", 10)).await.unwrap().id
    };

    let engine = OfflineEngine::new(config, StoreSchema::restaurant(), false).unwrap();
    assert_eq!(engine.pending_sync_count().unwrap(), 1);
    let record = inventory(&engine).get_by_id(&temp_id).await.unwrap().unwrap();
    assert_eq!(record.data.name, "Salt");
    assert!(record.pending_sync);
}
