//! Minimal end-to-end run: an in-memory store, a scheduler-style controller
//! watching the sandbox kind index, and one sandbox getting placed on a
//! ready node.

use async_trait::async_trait;
use attrdb_reconcile::{Context, Controller, ControllerOptions, Meta, Reconciler};
use attrdb_store::config::StoreConfig;
use attrdb_store::kv::MemoryKv;
use attrdb_store::schema::{AttributeSchema, SchemaType};
use attrdb_store::store::{EntityStore, Store, WriteOptions};
use attrdb_types::entity::ENTITY_KIND;
use attrdb_types::{Attr, Entity, Id, Value};
use std::sync::Arc;
use std::time::Duration;

struct Scheduler;

#[async_trait]
impl Reconciler for Scheduler {
    async fn reconcile(
        &self,
        ctx: &Context,
        entity: &Entity,
        meta: &mut Meta,
    ) -> anyhow::Result<()> {
        if entity.get("schedule.key").is_some() {
            return Ok(());
        }
        let ready = Attr::new("node/status", Value::keyword("READY"));
        let nodes = ctx.store.list_index(&ready).await?;
        let Some(node) = nodes.first() else {
            println!("no ready node for {:?}", entity.id());
            return Ok(());
        };
        println!("placing {:?} on {node}", entity.id());
        let key = Entity::new()
            .with("schedule.kind", Value::keyword("sandbox"))
            .with("schedule.node", Value::Id(node.clone()));
        meta.update([Attr::new("schedule.key", Value::component(key))]);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(EntityStore::new(
        Arc::new(MemoryKv::new()),
        StoreConfig::default(),
    ));

    for schema in [
        AttributeSchema::new("node/status", SchemaType::Keyword).indexed(),
        AttributeSchema::new("sandbox/status", SchemaType::Keyword),
        AttributeSchema::new("schedule.key", SchemaType::Component),
        AttributeSchema::new("schedule.kind", SchemaType::Keyword),
        AttributeSchema::new("schedule.node", SchemaType::Ref),
    ] {
        store
            .create(schema.to_entity(), WriteOptions::new())
            .await?;
    }

    let mut node = Entity::new()
        .with(ENTITY_KIND, Value::id("miren/kind.node"))
        .with("node/status", Value::keyword("READY"));
    node.set_id(Id::new("n1"));
    store.create(node, WriteOptions::new()).await?;

    let controller = Controller::from_reconciler(
        store.clone() as Arc<dyn Store>,
        Scheduler,
        ControllerOptions::new(
            "scheduler",
            Attr::new(ENTITY_KIND, Value::id("miren/kind.sandbox")),
        )
        .resync_period(Duration::from_millis(100)),
    );
    controller.start().await?;

    let mut sandbox = Entity::new()
        .with(ENTITY_KIND, Value::id("miren/kind.sandbox"))
        .with("sandbox/status", Value::keyword("PENDING"));
    sandbox.set_id(Id::new("s1"));
    store.create(sandbox, WriteOptions::new()).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    controller.stop().await;

    let scheduled = store.get(&Id::new("s1")).await?;
    let key = scheduled
        .get_value("schedule.key")
        .and_then(Value::as_component)
        .expect("sandbox was scheduled");
    println!(
        "s1 scheduled on {}",
        key.get_value("schedule.node").expect("node set")
    );
    Ok(())
}
