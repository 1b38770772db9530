//! The store contract consumed by controllers, and the KV-backed
//! implementation.

mod entity_store;

use crate::error::{Result, StoreError};
use crate::kv::{KvWatch, LeaseId};
use crate::schema::AttributeSchema;
use async_trait::async_trait;
use attrdb_types::{Attr, Entity, Id};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use entity_store::EntityStore;

/// Entities per underlying read transaction in [`Store::get_batch`]. Each
/// entity consumes two operations against a 128-op transaction ceiling.
pub const MAX_ENTITIES_PER_BATCH: usize = 64;

/// Opaque session identifier wrapping an external KV lease id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn from_lease(lease: LeaseId) -> Self {
        SessionId(lease.to_be_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn lease(&self) -> Result<LeaseId> {
        let bytes: [u8; 8] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Transport("malformed session id".to_string()))?;
        Ok(LeaseId::from_be_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

/// Options recognized by write operations.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Co-write session sidecar and session-scoped index entries, bound to
    /// the session's lease.
    pub session: Option<SessionId>,
    /// Additionally bind the primary record lifetime to the lease.
    pub bind_to_session: Option<SessionId>,
    /// Precondition on the entity's mod-revision.
    pub from_revision: Option<i64>,
    /// On `create`, fall back to an unconditional put when the identity
    /// exists with different attributes.
    pub overwrite: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session: &SessionId) -> Self {
        self.session = Some(session.clone());
        self
    }

    pub fn bind_to_session(mut self, session: &SessionId) -> Self {
        self.bind_to_session = Some(session.clone());
        self.session = Some(session.clone());
        self
    }

    pub fn from_revision(mut self, revision: i64) -> Self {
        self.from_revision = Some(revision);
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOp {
    Created,
    Updated,
    Deleted,
    /// Initial-state delivery when a watch opens on an existing entity.
    Stated,
}

#[derive(Debug, Clone)]
pub struct EntityEvent {
    pub op: EntityOp,
    pub id: Id,
    pub revision: i64,
    pub entity: Option<Entity>,
}

/// Stream of entity events. Dropping it cancels the watch.
pub struct EntityWatch {
    rx: mpsc::Receiver<EntityEvent>,
}

impl EntityWatch {
    pub fn new(rx: mpsc::Receiver<EntityEvent>) -> Self {
        EntityWatch { rx }
    }

    pub async fn recv(&mut self) -> Option<EntityEvent> {
        self.rx.recv().await
    }
}

/// The store interface consumed by controllers.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, id: &Id) -> Result<Entity>;

    /// Batched fetch; results align with `ids`, `None` for missing.
    async fn get_batch(&self, ids: &[Id]) -> Result<Vec<Option<Entity>>>;

    async fn create(&self, entity: Entity, opts: WriteOptions) -> Result<Entity>;

    /// Idempotent create: returns the existing entity with `created=false`,
    /// or creates and returns `created=true`.
    async fn ensure(&self, entity: Entity, opts: WriteOptions) -> Result<(Entity, bool)>;

    /// Guarded merge of `patch` into the current entity.
    async fn update(&self, id: &Id, patch: Vec<Attr>, opts: WriteOptions) -> Result<Entity>;

    /// Semantically identical to [`Store::update`]; distinguishes intent at
    /// higher layers.
    async fn patch(&self, entity: Entity, opts: WriteOptions) -> Result<Entity>;

    /// Wholesale replacement of the entity's attributes.
    async fn replace(&self, entity: Entity, opts: WriteOptions) -> Result<Entity>;

    /// Idempotent delete.
    async fn delete(&self, id: &Id) -> Result<()>;

    /// Ids of every entity carrying the given indexed attribute value.
    async fn list_index(&self, attr: &Attr) -> Result<Vec<Id>>;

    async fn watch_entity(&self, id: &Id) -> Result<EntityWatch>;

    /// Raw KV events under the attribute's index collection. `db/id` is
    /// special-cased to a single-entity watch.
    async fn watch_index(&self, attr: &Attr) -> Result<KvWatch>;

    async fn create_session(&self, ttl: Duration) -> Result<SessionId>;

    async fn revoke_session(&self, session: &SessionId) -> Result<()>;

    async fn ping_session(&self, session: &SessionId) -> Result<()>;

    async fn list_session_entities(&self, session: &SessionId) -> Result<Vec<Id>>;

    async fn attribute_schema(&self, id: &Id) -> Result<Arc<AttributeSchema>>;
}
