use attrdb_store::config::StoreConfig;
use attrdb_store::kv::{KvEventKind, MemoryKv};
use attrdb_store::schema::{AttributeSchema, SchemaType};
use attrdb_store::store::{EntityStore, Store, WriteOptions};
use attrdb_store::StoreError;
use attrdb_types::entity::{ATTR_SESSION, ENTITY_TTL};
use attrdb_types::{Attr, Entity, Id, Value};
use std::sync::Arc;
use std::time::Duration;

fn store() -> EntityStore<MemoryKv> {
    EntityStore::new(Arc::new(MemoryKv::new()), StoreConfig::default())
}

async fn register(store: &EntityStore<MemoryKv>, schema: AttributeSchema) {
    store
        .create(schema.to_entity(), WriteOptions::new())
        .await
        .expect("schema create");
}

/// Session-scoped attributes disappear on revoke while the entity remains,
/// and watchers on the index observe the session-scoped entry deletion.
#[tokio::test]
async fn session_revoke_removes_session_attributes_but_keeps_entity() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("app/kind", SchemaType::Keyword).indexed(),
    )
    .await;
    register(
        &store,
        AttributeSchema::new("app/status", SchemaType::Keyword).many().session(),
    )
    .await;

    let session = store.create_session(Duration::from_secs(60)).await.unwrap();

    let mut entity = Entity::new().with("app/kind", Value::keyword("foo"));
    entity.set_id(Id::new("E"));
    store.create(entity, WriteOptions::new()).await.unwrap();

    let kind_attr = Attr::new("app/kind", Value::keyword("foo"));
    let mut index_watch = store.watch_index(&kind_attr).await.unwrap();

    store
        .update(
            &Id::new("E"),
            vec![Attr::new("app/status", Value::keyword("foo"))],
            WriteOptions::new().session(&session),
        )
        .await
        .unwrap();

    let with_status = store.get(&Id::new("E")).await.unwrap();
    assert_eq!(
        with_status.get_value("app/status").unwrap(),
        &Value::keyword("foo")
    );
    assert!(with_status.get(ATTR_SESSION).is_some());

    // The session write produced a session-scoped index entry for app/kind.
    let put = index_watch.recv().await.unwrap();
    assert_eq!(put.kind, KvEventKind::Put);

    store.revoke_session(&session).await.unwrap();

    let without_status = store.get(&Id::new("E")).await.unwrap();
    assert!(without_status.get("app/status").is_none());
    assert!(without_status.get(ATTR_SESSION).is_none());

    // The leased session-scoped entry is deleted with the session.
    let mut saw_delete = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), index_watch.recv()).await
    {
        if event.kind == KvEventKind::Delete {
            saw_delete = true;
            break;
        }
    }
    assert!(saw_delete);

    // The plain index entry survives: the attribute still exists.
    assert_eq!(
        store.list_index(&kind_attr).await.unwrap(),
        vec![Id::new("E")]
    );
}

#[tokio::test]
async fn bound_entity_dies_with_its_session() {
    let store = store();
    register(&store, AttributeSchema::new("app/kind", SchemaType::Keyword)).await;

    let session = store.create_session(Duration::from_secs(60)).await.unwrap();
    let mut entity = Entity::new().with("app/kind", Value::keyword("worker"));
    entity.set_id(Id::new("W"));
    store
        .create(entity, WriteOptions::new().bind_to_session(&session))
        .await
        .unwrap();

    // Remaining lease TTL is surfaced on reads of bound entities.
    let fetched = store.get(&Id::new("W")).await.unwrap();
    assert!(fetched.get(ENTITY_TTL).is_some());

    store.revoke_session(&session).await.unwrap();
    assert!(matches!(
        store.get(&Id::new("W")).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[tokio::test]
async fn list_session_entities_enumerates_lease_keys() {
    let store = store();
    register(&store, AttributeSchema::new("app/kind", SchemaType::Keyword)).await;
    register(
        &store,
        AttributeSchema::new("app/status", SchemaType::Keyword).session(),
    )
    .await;

    let session = store.create_session(Duration::from_secs(60)).await.unwrap();

    let mut bound = Entity::new().with("app/kind", Value::keyword("a"));
    bound.set_id(Id::new("A"));
    store
        .create(bound, WriteOptions::new().bind_to_session(&session))
        .await
        .unwrap();

    let mut plain = Entity::new().with("app/kind", Value::keyword("b"));
    plain.set_id(Id::new("B"));
    store.create(plain, WriteOptions::new()).await.unwrap();
    store
        .update(
            &Id::new("B"),
            vec![Attr::new("app/status", Value::keyword("busy"))],
            WriteOptions::new().session(&session),
        )
        .await
        .unwrap();

    let mut ids = store.list_session_entities(&session).await.unwrap();
    ids.sort();
    assert_eq!(ids, vec![Id::new("A"), Id::new("B")]);
}

#[tokio::test]
async fn ping_keeps_session_alive() {
    let store = store();
    let session = store.create_session(Duration::from_secs(60)).await.unwrap();
    store.ping_session(&session).await.unwrap();
    store.revoke_session(&session).await.unwrap();
    assert!(store.ping_session(&session).await.is_err());
}

#[tokio::test]
async fn session_ttl_expiry_behaves_like_revoke() {
    let store = store();
    register(
        &store,
        AttributeSchema::new("app/status", SchemaType::Keyword).session(),
    )
    .await;
    register(&store, AttributeSchema::new("app/kind", SchemaType::Keyword)).await;

    let session = store
        .create_session(Duration::from_millis(10))
        .await
        .unwrap();
    let mut entity = Entity::new().with("app/kind", Value::keyword("x"));
    entity.set_id(Id::new("E"));
    store.create(entity, WriteOptions::new()).await.unwrap();
    store
        .update(
            &Id::new("E"),
            vec![Attr::new("app/status", Value::keyword("warm"))],
            WriteOptions::new().session(&session),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let fetched = store.get(&Id::new("E")).await.unwrap();
    assert!(fetched.get("app/status").is_none());
}
