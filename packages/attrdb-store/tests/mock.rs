use attrdb_store::kv::KvEventKind;
use attrdb_store::schema::{AttributeSchema, SchemaType};
use attrdb_store::store::{EntityOp, Store, WriteOptions};
use attrdb_store::{MockStore, StoreError};
use attrdb_types::{Attr, Entity, Id, Value};
use std::time::Duration;

fn entity(id: &str, status: &str) -> Entity {
    let mut e = Entity::new().with("node/status", Value::keyword(status));
    e.set_id(Id::new(id));
    e
}

#[tokio::test]
async fn mock_honors_revision_and_timestamps() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("node/status", SchemaType::Keyword));

    let created = mock
        .create(entity("n1", "PENDING"), WriteOptions::new())
        .await
        .unwrap();
    assert!(created.revision() > 0);
    assert!(created.created_at().is_some());

    let updated = mock
        .update(
            &Id::new("n1"),
            vec![Attr::new("node/status", Value::keyword("READY"))],
            WriteOptions::new(),
        )
        .await
        .unwrap();
    assert!(updated.revision() > created.revision());
    assert_eq!(updated.created_at(), created.created_at());
    assert!(updated.updated_at() >= created.updated_at());
}

#[tokio::test]
async fn mock_validates_like_the_real_store() {
    let mock = MockStore::new();
    let mut bad = Entity::new().with("unknown/attr", 1i64);
    bad.set_id(Id::new("x"));
    let err = mock.create(bad, WriteOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn mock_indexed_flip_matches_contract() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("app/default", SchemaType::Bool).indexed());

    let mut e1 = Entity::new().with("app/default", true);
    e1.set_id(Id::new("E1"));
    let mut e2 = Entity::new().with("app/default", false);
    e2.set_id(Id::new("E2"));
    mock.create(e1, WriteOptions::new()).await.unwrap();
    mock.create(e2, WriteOptions::new()).await.unwrap();

    let truthy = Attr::new("app/default", true);
    assert_eq!(
        mock.list_index(&truthy).await.unwrap(),
        vec![Id::new("E1")]
    );

    mock.update(
        &Id::new("E2"),
        vec![Attr::new("app/default", true)],
        WriteOptions::new(),
    )
    .await
    .unwrap();

    let mut both = mock.list_index(&truthy).await.unwrap();
    both.sort();
    assert_eq!(both, vec![Id::new("E1"), Id::new("E2")]);
    assert!(mock
        .list_index(&Attr::new("app/default", false))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn mock_matches_indexed_attrs_inside_components() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("sched/key", SchemaType::Component));
    mock.register_schema(&AttributeSchema::new("sched/node", SchemaType::Ref).indexed());

    let mut node = Entity::new();
    node.set_id(Id::new("n1"));
    mock.create(node, WriteOptions::new()).await.unwrap();

    let fragment = Entity::new().with("sched/node", Value::id("n1"));
    let mut sandbox = Entity::new().with("sched/key", Value::component(fragment));
    sandbox.set_id(Id::new("s1"));
    mock.create(sandbox, WriteOptions::new()).await.unwrap();

    let by_node = Attr::new("sched/node", Value::id("n1"));
    assert_eq!(mock.list_index(&by_node).await.unwrap(), vec![Id::new("s1")]);
}

#[tokio::test]
async fn mock_on_list_index_hook_overrides() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("app/default", SchemaType::Bool).indexed());
    mock.set_on_list_index(|_attr| Some(Ok(vec![Id::new("injected")])));

    let ids = mock
        .list_index(&Attr::new("app/default", true))
        .await
        .unwrap();
    assert_eq!(ids, vec![Id::new("injected")]);
}

#[tokio::test]
async fn mock_watch_entity_delivers_events() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("node/status", SchemaType::Keyword));

    mock.create(entity("n1", "PENDING"), WriteOptions::new())
        .await
        .unwrap();
    let mut watch = mock.watch_entity(&Id::new("n1")).await.unwrap();
    let stated = watch.recv().await.unwrap();
    assert_eq!(stated.op, EntityOp::Stated);

    mock.update(
        &Id::new("n1"),
        vec![Attr::new("node/status", Value::keyword("READY"))],
        WriteOptions::new(),
    )
    .await
    .unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.op, EntityOp::Updated);

    mock.delete(&Id::new("n1")).await.unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.op, EntityOp::Deleted);
}

#[tokio::test]
async fn mock_watch_index_sees_puts_and_deletes() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("node/status", SchemaType::Keyword).indexed());

    let ready = Attr::new("node/status", Value::keyword("READY"));
    let mut watch = mock.watch_index(&ready).await.unwrap();

    mock.create(entity("n1", "READY"), WriteOptions::new())
        .await
        .unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.kind, KvEventKind::Put);

    mock.update(
        &Id::new("n1"),
        vec![Attr::new("node/status", Value::keyword("DISABLED"))],
        WriteOptions::new(),
    )
    .await
    .unwrap();
    let event = watch.recv().await.unwrap();
    assert_eq!(event.kind, KvEventKind::Delete);
}

#[tokio::test]
async fn mock_sessions_mirror_lease_semantics() {
    let mock = MockStore::new();
    mock.register_schema(&AttributeSchema::new("app/kind", SchemaType::Keyword));
    mock.register_schema(
        &AttributeSchema::new("app/status", SchemaType::Keyword).many().session(),
    );

    let session = mock.create_session(Duration::from_secs(30)).await.unwrap();

    let mut e = Entity::new().with("app/kind", Value::keyword("foo"));
    e.set_id(Id::new("E"));
    mock.create(e, WriteOptions::new()).await.unwrap();
    mock.update(
        &Id::new("E"),
        vec![Attr::new("app/status", Value::keyword("warm"))],
        WriteOptions::new().session(&session),
    )
    .await
    .unwrap();

    let with_status = mock.get(&Id::new("E")).await.unwrap();
    assert!(with_status.get("app/status").is_some());
    assert_eq!(
        mock.list_session_entities(&session).await.unwrap(),
        vec![Id::new("E")]
    );

    mock.revoke_session(&session).await.unwrap();
    let without = mock.get(&Id::new("E")).await.unwrap();
    assert!(without.get("app/status").is_none());

    let mut bound = Entity::new().with("app/kind", Value::keyword("bar"));
    bound.set_id(Id::new("B"));
    let session2 = mock.create_session(Duration::from_secs(30)).await.unwrap();
    mock.create(bound, WriteOptions::new().bind_to_session(&session2))
        .await
        .unwrap();
    mock.revoke_session(&session2).await.unwrap();
    assert!(matches!(
        mock.get(&Id::new("B")).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
}
