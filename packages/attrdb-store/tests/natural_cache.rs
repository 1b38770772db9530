//! End-to-end natural-codec flow: an encoded domain schema stored on a
//! schema entity, kind resolution through the cache, document decode into a
//! stored entity, and encode back out.

use attrdb_store::config::StoreConfig;
use attrdb_store::kv::MemoryKv;
use attrdb_store::natural;
use attrdb_store::schema::{
    AttributeSchema, DomainSchema, EncodedField, EncodedKind, SchemaCache, SchemaType, DB_SCHEMA,
};
use attrdb_store::store::{EntityStore, Store, WriteOptions};
use attrdb_types::entity::ENTITY_SCHEMA;
use attrdb_types::{Entity, Id, Value};
use std::sync::Arc;

fn domain_schema() -> DomainSchema {
    DomainSchema {
        domain: "miren".to_string(),
        version: "v1".to_string(),
        kinds: vec![EncodedKind {
            kind: "sandbox".to_string(),
            fields: vec![
                EncodedField::new("image", "string", "sandbox/image"),
                EncodedField::new("replicas", "int", "sandbox/replicas"),
                EncodedField::new("labels", "label", "sandbox/labels").many(),
            ],
        }],
    }
}

async fn seeded_store() -> EntityStore<MemoryKv> {
    let store = EntityStore::new(Arc::new(MemoryKv::new()), StoreConfig::default());
    for schema in [
        AttributeSchema::new("sandbox/image", SchemaType::String),
        AttributeSchema::new("sandbox/replicas", SchemaType::Int),
        AttributeSchema::new("sandbox/labels", SchemaType::Label).many(),
    ] {
        store
            .create(schema.to_entity(), WriteOptions::new())
            .await
            .unwrap();
    }

    // The schema entity carries the gzip+CBOR domain schema.
    let mut schema_entity = Entity::new().with(
        DB_SCHEMA,
        Value::Bytes(domain_schema().encode().unwrap()),
    );
    schema_entity.set_id(Id::new("miren/schema"));
    store
        .create(schema_entity, WriteOptions::new())
        .await
        .unwrap();

    // The kind entity names its domain schema.
    let mut kind_entity = Entity::new().with(ENTITY_SCHEMA, Value::id("miren/schema"));
    kind_entity.set_id(Id::new("miren/kind.sandbox"));
    store.create(kind_entity, WriteOptions::new()).await.unwrap();

    store
}

#[tokio::test]
async fn kind_schema_resolves_through_cache() {
    let store = seeded_store().await;
    let cache = SchemaCache::new(128);

    let kind = cache
        .kind_schema(&Id::new("miren/kind.sandbox"), &store)
        .await
        .unwrap();
    assert_eq!(kind.domain, "miren");
    assert_eq!(kind.kind, "sandbox");
    assert_eq!(kind.fields.len(), 3);
    assert_eq!(kind.document_kind(), "miren/sandbox");
    assert_eq!(kind.kind_id().as_str(), "miren/kind.sandbox");

    // Second resolution is served from the LRU.
    let again = cache
        .kind_schema(&Id::new("miren/kind.sandbox"), &store)
        .await
        .unwrap();
    assert_eq!(kind, again);
}

#[tokio::test]
async fn document_decodes_stores_and_encodes_back() {
    let store = seeded_store().await;
    let cache = SchemaCache::new(128);
    let kind = cache
        .kind_schema(&Id::new("miren/kind.sandbox"), &store)
        .await
        .unwrap();

    let doc = natural::document_from_yaml(
        r#"
kind: miren/sandbox
version: v1
spec:
  image: "registry.example.com/app:2"
  replicas: 3
  labels:
    - tier=web
"#,
    )
    .unwrap();

    let attrs = natural::decode(&doc, &kind).unwrap();
    let mut entity = Entity::from_attrs(attrs);
    entity.set_id(Id::new("s1"));
    store.create(entity, WriteOptions::new()).await.unwrap();

    let stored = store.get(&Id::new("s1")).await.unwrap();
    assert_eq!(
        stored.get_value("sandbox/replicas").unwrap(),
        &Value::Int(3)
    );
    assert_eq!(stored.kinds()[0].as_str(), "miren/kind.sandbox");

    let encoded = natural::encode(&stored, &kind).unwrap();
    assert_eq!(encoded.kind, "miren/sandbox");
    assert_eq!(encoded.spec["image"], "registry.example.com/app:2");
    assert_eq!(encoded.spec["replicas"], 3);
    assert_eq!(encoded.spec["labels"], serde_json::json!(["tier=web"]));
}
