use attrdb_store::config::StoreConfig;
use attrdb_store::kv::MemoryKv;
use attrdb_store::schema::{AttributeSchema, SchemaType};
use attrdb_store::store::{EntityOp, EntityStore, Store, WriteOptions};
use attrdb_store::StoreError;
use attrdb_types::entity::{DB_ENSURE, ENTITY_KIND};
use attrdb_types::{Attr, Entity, Id, Value};
use std::sync::Arc;

fn store() -> EntityStore<MemoryKv> {
    EntityStore::new(Arc::new(MemoryKv::new()), StoreConfig::default())
}

async fn register(store: &EntityStore<MemoryKv>, schema: AttributeSchema) {
    store
        .create(schema.to_entity(), WriteOptions::new())
        .await
        .expect("schema create");
}

fn node(id: &str, status: &str) -> Entity {
    let mut e = Entity::new()
        .with(ENTITY_KIND, Value::id("miren/kind.node"))
        .with("node/status", Value::keyword(status));
    e.set_id(Id::new(id));
    e
}

#[tokio::test]
async fn create_get_round_trip() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("node/status", SchemaType::Keyword).indexed(),
    )
    .await;

    let created = store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    assert!(created.revision() > 0);

    let fetched = store.get(&Id::new("n1")).await.unwrap();
    assert_eq!(fetched.id().unwrap().as_str(), "n1");
    assert_eq!(
        fetched.get_value("node/status").unwrap(),
        &Value::keyword("READY")
    );
    assert!(fetched.created_at().is_some());
    assert!(fetched.updated_at().is_some());
    assert_eq!(fetched.revision(), created.revision());
}

#[tokio::test]
async fn missing_entity_is_not_found() {
    let store = store();
    let err = store.get(&Id::new("ghost")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn create_synthesizes_id_from_kind() {
    let store = store();
    let entity = Entity::new().with(ENTITY_KIND, Value::id("miren/kind.sandbox"));
    let created = store.create(entity, WriteOptions::new()).await.unwrap();
    assert!(created.id().unwrap().as_str().starts_with("sandbox-"));

    let plain = store.create(Entity::new(), WriteOptions::new()).await.unwrap();
    assert!(plain.id().unwrap().as_str().starts_with("e-"));
}

#[tokio::test]
async fn create_twice_with_equal_attrs_adopts_existing() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let first = store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let second = store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    assert_eq!(second.revision(), first.revision());
}

#[tokio::test]
async fn create_conflict_and_overwrite() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let err = store
        .create(node("n1", "DISABLED"), WriteOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let replaced = store
        .create(node("n1", "DISABLED"), WriteOptions::new().overwrite())
        .await
        .unwrap();
    assert_eq!(
        replaced.get_value("node/status").unwrap(),
        &Value::keyword("DISABLED")
    );
}

#[tokio::test]
async fn cardinality_one_is_enforced() {
    let store = store();
    register(&store, AttributeSchema::new("node/name", SchemaType::String)).await;

    let mut entity = Entity::new()
        .with("node/name", "a")
        .with("node/name", "b");
    entity.set_id(Id::new("n1"));
    let err = store.create(entity, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn validation_aggregates_all_failures() {
    let store = store();
    let mut entity = Entity::new()
        .with("bogus/one", 1i64)
        .with("bogus/two", 2i64);
    entity.set_id(Id::new("n1"));
    let err = store.create(entity, WriteOptions::new()).await.unwrap_err();
    let StoreError::Validation(errors) = err else {
        panic!("expected validation error, got {err}");
    };
    assert_eq!(errors.len(), 2);
}

#[tokio::test]
async fn update_replaces_cardinality_one_and_bumps_revision() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let created = store
        .create(node("n1", "PENDING"), WriteOptions::new())
        .await
        .unwrap();
    let updated = store
        .update(
            &Id::new("n1"),
            vec![Attr::new("node/status", Value::keyword("READY"))],
            WriteOptions::new(),
        )
        .await
        .unwrap();

    assert!(updated.revision() > created.revision());
    assert_eq!(updated.get_all("node/status").len(), 1);
    assert_eq!(
        updated.get_value("node/status").unwrap(),
        &Value::keyword("READY")
    );
    assert_eq!(updated.created_at(), created.created_at());
    assert!(updated.updated_at() >= created.updated_at());
}

#[tokio::test]
async fn stale_from_revision_conflicts() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let created = store
        .create(node("n1", "PENDING"), WriteOptions::new())
        .await
        .unwrap();
    store
        .update(
            &Id::new("n1"),
            vec![Attr::new("node/status", Value::keyword("READY"))],
            WriteOptions::new(),
        )
        .await
        .unwrap();

    let err = store
        .update(
            &Id::new("n1"),
            vec![Attr::new("node/status", Value::keyword("DISABLED"))],
            WriteOptions::new().from_revision(created.revision()),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn indexed_bool_flip() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("app/default", SchemaType::Bool).indexed(),
    )
    .await;

    let mut e1 = Entity::new().with("app/default", true);
    e1.set_id(Id::new("E1"));
    let mut e2 = Entity::new().with("app/default", false);
    e2.set_id(Id::new("E2"));
    store.create(e1, WriteOptions::new()).await.unwrap();
    store.create(e2, WriteOptions::new()).await.unwrap();

    let truthy = Attr::new("app/default", true);
    let falsy = Attr::new("app/default", false);

    assert_eq!(store.list_index(&truthy).await.unwrap(), vec![Id::new("E1")]);

    store
        .update(
            &Id::new("E2"),
            vec![Attr::new("app/default", true)],
            WriteOptions::new(),
        )
        .await
        .unwrap();

    let mut both = store.list_index(&truthy).await.unwrap();
    both.sort();
    assert_eq!(both, vec![Id::new("E1"), Id::new("E2")]);
    assert!(store.list_index(&falsy).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_clears_index_entries_and_is_idempotent() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("node/status", SchemaType::Keyword).indexed(),
    )
    .await;

    store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let ready = Attr::new("node/status", Value::keyword("READY"));
    assert_eq!(store.list_index(&ready).await.unwrap(), vec![Id::new("n1")]);

    store.delete(&Id::new("n1")).await.unwrap();
    assert!(store.list_index(&ready).await.unwrap().is_empty());
    assert!(matches!(
        store.get(&Id::new("n1")).await.unwrap_err(),
        StoreError::NotFound(_)
    ));

    // Missing entity is a successful no-op.
    store.delete(&Id::new("n1")).await.unwrap();
}

#[tokio::test]
async fn ensure_is_idempotent() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let (first, created) = store
        .ensure(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    assert!(created);

    let (second, created) = store
        .ensure(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.revision(), first.revision());
}

#[tokio::test]
async fn ensure_required_attributes() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let mut ensure_set = Entity::new().with("db/ensure.attrs", Value::keyword("node/status"));
    ensure_set.set_id(Id::new("ensure/node"));
    store.create(ensure_set, WriteOptions::new()).await.unwrap();

    let mut missing = Entity::new().with(DB_ENSURE, Value::id("ensure/node"));
    missing.set_id(Id::new("n1"));
    let err = store.create(missing, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let mut ok = Entity::new()
        .with(DB_ENSURE, Value::id("ensure/node"))
        .with("node/status", Value::keyword("READY"));
    ok.set_id(Id::new("n2"));
    let created = store.create(ok, WriteOptions::new()).await.unwrap();
    // The ensure marker is stripped before storage.
    assert!(created.get(DB_ENSURE).is_none());
    let fetched = store.get(&Id::new("n2")).await.unwrap();
    assert!(fetched.get(DB_ENSURE).is_none());
}

#[tokio::test]
async fn dangling_ref_is_rejected() {
    let store = store();
    register(&store, AttributeSchema::new("sandbox/node", SchemaType::Ref)).await;

    let mut sandbox = Entity::new().with("sandbox/node", Value::id("n-missing"));
    sandbox.set_id(Id::new("s1"));
    let err = store.create(sandbox, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    store
        .create(
            {
                let mut n = Entity::new();
                n.set_id(Id::new("n-missing"));
                n
            },
            WriteOptions::new(),
        )
        .await
        .unwrap();
    let mut sandbox = Entity::new().with("sandbox/node", Value::id("n-missing"));
    sandbox.set_id(Id::new("s1"));
    store.create(sandbox, WriteOptions::new()).await.unwrap();
}

#[tokio::test]
async fn predicate_gates_writes() {
    let store = store();

    let mut pred = Entity::new().with("db/program", r#"value != "" && len(value) <= 5"#);
    pred.set_id(Id::new("pred/short-name"));
    store.create(pred, WriteOptions::new()).await.unwrap();

    register(
        &store,
        AttributeSchema::new("node/name", SchemaType::String)
            .with_predicate(Id::new("pred/short-name")),
    )
    .await;

    let mut ok = Entity::new().with("node/name", "abc");
    ok.set_id(Id::new("n1"));
    store.create(ok, WriteOptions::new()).await.unwrap();

    let mut too_long = Entity::new().with("node/name", "toolongname");
    too_long.set_id(Id::new("n2"));
    let err = store.create(too_long, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn enum_values_are_enforced() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("sandbox/phase", SchemaType::Enum).with_enum(vec![
            Value::keyword("PENDING"),
            Value::keyword("READY"),
        ]),
    )
    .await;

    let mut ok = Entity::new().with("sandbox/phase", Value::keyword("READY"));
    ok.set_id(Id::new("s1"));
    store.create(ok, WriteOptions::new()).await.unwrap();

    let mut bad = Entity::new().with("sandbox/phase", Value::keyword("BOGUS"));
    bad.set_id(Id::new("s2"));
    let err = store.create(bad, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn get_batch_preserves_order_with_missing() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;
    store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    store
        .create(node("n3", "READY"), WriteOptions::new())
        .await
        .unwrap();

    let batch = store
        .get_batch(&[Id::new("n1"), Id::new("n2"), Id::new("n3")])
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].as_ref().unwrap().id().unwrap().as_str(), "n1");
    assert!(batch[1].is_none());
    assert_eq!(batch[2].as_ref().unwrap().id().unwrap().as_str(), "n3");
}

#[tokio::test]
async fn revisions_are_strictly_monotonic() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let mut last = store
        .create(node("n1", "S0"), WriteOptions::new())
        .await
        .unwrap()
        .revision();
    for i in 1..5 {
        let updated = store
            .update(
                &Id::new("n1"),
                vec![Attr::new("node/status", Value::keyword(format!("S{i}")))],
                WriteOptions::new(),
            )
            .await
            .unwrap();
        assert!(updated.revision() > last);
        last = updated.revision();
    }
}

#[tokio::test]
async fn watch_entity_sees_lifecycle() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let created = store
        .create(node("n1", "PENDING"), WriteOptions::new())
        .await
        .unwrap();

    let mut watch = store.watch_entity(&Id::new("n1")).await.unwrap();
    let stated = watch.recv().await.unwrap();
    assert_eq!(stated.op, EntityOp::Stated);
    assert_eq!(stated.revision, created.revision());

    let updated = store
        .update(
            &Id::new("n1"),
            vec![Attr::new("node/status", Value::keyword("READY"))],
            WriteOptions::new(),
        )
        .await
        .unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.op, EntityOp::Updated);
    assert_eq!(event.revision, updated.revision());
    assert_eq!(
        event
            .entity
            .as_ref()
            .unwrap()
            .get_value("node/status")
            .unwrap(),
        &Value::keyword("READY")
    );

    store.delete(&Id::new("n1")).await.unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.op, EntityOp::Deleted);
}

#[tokio::test]
async fn watch_index_yields_raw_events() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let kind = Attr::new(ENTITY_KIND, Value::id("miren/kind.node"));
    let mut watch = store.watch_index(&kind).await.unwrap();

    store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let event = watch.recv().await.unwrap();
    let id = store
        .keyspace()
        .entity_id_from_index_key(&event.kv.key)
        .unwrap();
    assert_eq!(id.as_str(), "n1");

    store.delete(&Id::new("n1")).await.unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.kind, attrdb_store::KvEventKind::Delete);
}

#[tokio::test]
async fn watch_index_requires_indexed_schema() {
    let store = store();
    register(&store, AttributeSchema::new("node/plain", SchemaType::String)).await;
    let err = store
        .watch_index(&Attr::new("node/plain", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn watch_index_db_id_special_case() {
    let store = store();
    register(&store, AttributeSchema::new("node/status", SchemaType::Keyword)).await;

    let by_id = Attr::new("db/id", Value::id("n1"));
    let mut watch = store.watch_index(&by_id).await.unwrap();

    store
        .create(node("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.kv.value, b"n1".to_vec());
    assert_eq!(
        store
            .keyspace()
            .entity_id_from_index_key(&event.kv.key)
            .unwrap()
            .as_str(),
        "n1"
    );
}
