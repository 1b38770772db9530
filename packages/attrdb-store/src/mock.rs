//! In-memory [`Store`] honoring the same contracts as the KV-backed store:
//! validation, revision and timestamp bookkeeping, index coherence, session
//! slices, and watches. Indexed attributes are matched by recursively
//! enumerating all attributes, nested components included. Intended for
//! controller tests; `on_list_index` injects faults.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError, ValidationError};
use crate::keys::KeySpace;
use crate::kv::{KvEvent, KvEventKind, KvWatch, KeyValue};
use crate::schema::registry::EntityFetcher;
use crate::schema::{AttributeSchema, Cardinality, SchemaRegistry};
use crate::store::{
    EntityEvent, EntityOp, EntityWatch, SessionId, Store, WriteOptions,
};
use crate::validate::Validator;
use async_trait::async_trait;
use attrdb_types::entity::{ATTR_SESSION, DB_ID, ENTITY_REVISION, ENTITY_TTL};
use attrdb_types::{Attr, Entity, Id, Value};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type ListIndexHook = Box<dyn Fn(&Attr) -> Option<Result<Vec<Id>>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct SessionSlice {
    attrs: Vec<Attr>,
    /// Content addresses of the session-scoped index entries this session
    /// holds, mirroring the lease-bound keys of the real store.
    index_cas: HashSet<String>,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    primary: Entity,
    sessions: HashMap<i64, SessionSlice>,
    bound_session: Option<i64>,
    revision: i64,
}

struct EntityWatcher {
    id: String,
    tx: mpsc::UnboundedSender<EntityEvent>,
}

struct IndexWatcher {
    cas: String,
    tx: mpsc::UnboundedSender<KvEvent>,
}

#[derive(Default)]
struct MockState {
    entities: BTreeMap<String, StoredEntity>,
    revision: i64,
    next_session: i64,
    live_sessions: HashSet<i64>,
    entity_watchers: Vec<EntityWatcher>,
    index_watchers: Vec<IndexWatcher>,
}

pub struct MockStore {
    registry: Arc<SchemaRegistry>,
    keys: KeySpace,
    state: Arc<Mutex<MockState>>,
    on_list_index: Mutex<Option<ListIndexHook>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        MockStore {
            registry: Arc::new(SchemaRegistry::new(config.schema_cache_entries)),
            keys: KeySpace::new(config.prefix),
            state: Arc::new(Mutex::new(MockState {
                next_session: 1,
                ..MockState::default()
            })),
            on_list_index: Mutex::new(None),
        }
    }

    /// Overrides `list_index` results; return `None` to fall through to the
    /// real computation.
    pub fn set_on_list_index(
        &self,
        hook: impl Fn(&Attr) -> Option<Result<Vec<Id>>> + Send + Sync + 'static,
    ) {
        *self.on_list_index.lock() = Some(Box::new(hook));
    }

    /// Installs a schema entity directly, bypassing write validation. Test
    /// setup convenience; `create` works for schemas too.
    pub fn register_schema(&self, schema: &AttributeSchema) {
        let mut entity = schema.to_entity();
        entity.remove(ENTITY_REVISION);
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        state.entities.insert(
            schema.id.as_str().to_string(),
            StoredEntity {
                primary: entity,
                sessions: HashMap::new(),
                bound_session: None,
                revision,
            },
        );
    }

    fn validator(&self) -> Validator<'_> {
        Validator::new(&self.registry, self)
    }

    fn assemble(stored: &StoredEntity) -> Entity {
        let mut entity = stored.primary.clone();
        for (session, slice) in &stored.sessions {
            entity.update(slice.attrs.iter().cloned());
            entity.add(Attr::new(
                ATTR_SESSION,
                Value::Bytes(SessionId::from_lease(*session).as_bytes().to_vec()),
            ));
        }
        entity.set_revision(stored.revision);
        entity
    }

    /// Recursively enumerates attributes, descending into component values.
    fn enumerate(entity: &Entity) -> Vec<Attr> {
        let mut out = Vec::new();
        let mut queue: Vec<Attr> = entity.attrs().to_vec();
        while let Some(attr) = queue.pop() {
            match &attr.value {
                Value::Component(fragment) => queue.extend(fragment.attrs().iter().cloned()),
                Value::Array(items) => {
                    for item in items {
                        if let Value::Component(fragment) = item {
                            queue.extend(fragment.attrs().iter().cloned());
                        }
                    }
                }
                _ => {}
            }
            out.push(attr);
        }
        out
    }

    fn contains(entity: &Entity, attr: &Attr) -> bool {
        Self::enumerate(entity).iter().any(|a| a == attr)
    }

    async fn indexed_attrs(&self, entity: &Entity) -> Result<Vec<Attr>> {
        let mut out = Vec::new();
        for attr in Self::enumerate(entity) {
            match self.registry.resolve(&attr.id, self).await {
                Ok(schema) if schema.index => out.push(attr),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn dispatch_entity_event(state: &mut MockState, event: EntityEvent) {
        let id = event.id.as_str().to_string();
        state.entity_watchers.retain(|w| {
            if w.id != id {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn dispatch_index_event(
        state: &mut MockState,
        keys: &KeySpace,
        cas: &str,
        id: &Id,
        session: Option<i64>,
        kind: KvEventKind,
        revision: i64,
    ) {
        state.index_watchers.retain(|w| {
            if w.cas != cas {
                return true;
            }
            let key = match session {
                Some(lease) => keys.session_index_entry(
                    cas,
                    id,
                    SessionId::from_lease(lease).as_bytes(),
                ),
                None => keys.index_entry(cas, id),
            };
            let event = KvEvent {
                kind,
                kv: KeyValue {
                    key,
                    value: match kind {
                        KvEventKind::Put => id.as_str().as_bytes().to_vec(),
                        KvEventKind::Delete => Vec::new(),
                    },
                    create_revision: 0,
                    mod_revision: revision,
                    lease: 0,
                },
                prev: None,
            };
            w.tx.send(event).is_ok()
        });
    }

    /// Commits a validated next state, maintaining revisions, index events,
    /// and session slices exactly as the KV-backed store would.
    async fn commit(
        &self,
        id: &Id,
        next: Entity,
        opts: &WriteOptions,
        is_create: bool,
    ) -> Result<Entity> {
        let mut next = next;
        next.remove(ENTITY_REVISION);
        next.remove(ENTITY_TTL);
        next.remove(ATTR_SESSION);

        // Split session-flagged attributes off the primary record.
        let mut primary = Vec::new();
        let mut session_attrs = Vec::new();
        for attr in next.into_attrs() {
            let is_session = match self.registry.resolve(&attr.id, self).await {
                Ok(schema) => schema.session,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if is_session {
                session_attrs.push(attr);
            } else {
                primary.push(attr);
            }
        }
        let primary = Entity::from_attrs(primary);

        let session_lease = match opts.session.as_ref().or(opts.bind_to_session.as_ref()) {
            Some(s) => Some(s.lease()?),
            None => None,
        };
        let bound = match &opts.bind_to_session {
            Some(s) => Some(s.lease()?),
            None => None,
        };

        let assembled_next = {
            let mut e = primary.clone();
            e.update(session_attrs.iter().cloned());
            e
        };
        let indexed = self.indexed_attrs(&assembled_next).await?;

        let prev = {
            let state = self.state.lock();
            state.entities.get(id.as_str()).cloned()
        };
        let prev_indexed = match &prev {
            Some(p) => self.indexed_attrs(&Self::assemble(p)).await?,
            None => Vec::new(),
        };

        let mut state = self.state.lock();
        if let Some(lease) = session_lease {
            if !state.live_sessions.contains(&lease) {
                return Err(StoreError::Transport(format!("lease {lease} not found")));
            }
        }

        if is_create {
            if let Some(prev) = &prev {
                if prev.primary.timeless() == primary.timeless() {
                    return Ok(Self::assemble(prev));
                }
                if !opts.overwrite {
                    return Err(StoreError::conflict(
                        id,
                        "entity exists with different attributes",
                    ));
                }
            }
        }

        state.revision += 1;
        let revision = state.revision;

        let mut stored = prev.clone().unwrap_or(StoredEntity {
            primary: Entity::new(),
            sessions: HashMap::new(),
            bound_session: None,
            revision: 0,
        });
        stored.primary = primary;
        stored.revision = revision;
        stored.bound_session = bound.or(stored.bound_session);
        if let Some(lease) = session_lease {
            let slice = stored.sessions.entry(lease).or_default();
            if !session_attrs.is_empty() {
                slice.attrs = session_attrs.clone();
            }
            slice.index_cas = indexed.iter().map(Attr::cas).collect();
        }

        let assembled = Self::assemble(&stored);
        state
            .entities
            .insert(id.as_str().to_string(), stored);

        // Index events: every still-present indexed attribute is re-put; a
        // previously indexed value no longer present is deleted.
        let keys = self.keys.clone();
        for attr in &indexed {
            Self::dispatch_index_event(
                &mut state,
                &keys,
                &attr.cas(),
                id,
                None,
                KvEventKind::Put,
                revision,
            );
        }
        for attr in &prev_indexed {
            if !indexed.contains(attr) {
                Self::dispatch_index_event(
                    &mut state,
                    &keys,
                    &attr.cas(),
                    id,
                    None,
                    KvEventKind::Delete,
                    revision,
                );
            }
        }

        let op = if is_create && prev.is_none() {
            EntityOp::Created
        } else {
            EntityOp::Updated
        };
        Self::dispatch_entity_event(
            &mut state,
            EntityEvent {
                op,
                id: id.clone(),
                revision,
                entity: Some(assembled.clone()),
            },
        );

        Ok(assembled)
    }
}

#[async_trait]
impl EntityFetcher for MockStore {
    async fn fetch(&self, id: &Id) -> Result<Option<Entity>> {
        let state = self.state.lock();
        Ok(state
            .entities
            .get(id.as_str())
            .map(|stored| {
                let mut e = stored.primary.clone();
                e.set_revision(stored.revision);
                e
            }))
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get(&self, id: &Id) -> Result<Entity> {
        let state = self.state.lock();
        state
            .entities
            .get(id.as_str())
            .map(Self::assemble)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn get_batch(&self, ids: &[Id]) -> Result<Vec<Option<Entity>>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .map(|id| state.entities.get(id.as_str()).map(Self::assemble))
            .collect())
    }

    async fn create(&self, entity: Entity, opts: WriteOptions) -> Result<Entity> {
        let mut entity = entity;
        let id = match entity.id() {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let prefix = entity
                    .kinds()
                    .first()
                    .map(|k| k.last_segment().to_string())
                    .unwrap_or_else(|| "e".to_string());
                entity.force_id(&prefix)
            }
        };
        entity.remove(ENTITY_REVISION);
        entity.remove(ENTITY_TTL);
        entity.remove(ATTR_SESSION);
        let now = Utc::now();
        if entity.created_at().is_none() {
            entity.set_created_at(now);
        }
        entity.set_updated_at(now);
        let entity = self.validator().validate_entity(entity).await?;
        self.commit(&id, entity, &opts, true).await
    }

    async fn ensure(&self, entity: Entity, opts: WriteOptions) -> Result<(Entity, bool)> {
        if let Some(id) = entity.id() {
            if let Ok(existing) = self.get(id).await {
                return Ok((existing, false));
            }
        }
        match self.create(entity.clone(), opts).await {
            Ok(created) => Ok((created, true)),
            Err(err) if err.is_conflict() => {
                let id = entity
                    .id()
                    .cloned()
                    .ok_or_else(|| StoreError::conflict(&Id::new("?"), "racing create"))?;
                Ok((self.get(&id).await?, false))
            }
            Err(err) => Err(err),
        }
    }

    async fn update(&self, id: &Id, patch: Vec<Attr>, opts: WriteOptions) -> Result<Entity> {
        let (base, current_revision) = {
            let state = self.state.lock();
            let Some(stored) = state.entities.get(id.as_str()) else {
                return Err(StoreError::NotFound(id.clone()));
            };
            let mut base = stored.primary.clone();
            if let Some(session) = opts.session.as_ref().or(opts.bind_to_session.as_ref()) {
                if let Some(slice) = stored.sessions.get(&session.lease()?) {
                    base.update(slice.attrs.iter().cloned());
                }
            }
            (base, stored.revision)
        };
        if let Some(expected) = opts.from_revision {
            if expected != current_revision {
                return Err(StoreError::conflict(
                    id,
                    format!("expected revision {expected}, found {current_revision}"),
                ));
            }
        }

        let mut next = base.clone();
        for attr in &patch {
            let replaces = match self.registry.resolve(&attr.id, self).await {
                Ok(schema) => schema.cardinality == Cardinality::One,
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e),
            };
            if replaces {
                next.remove(attr.id.as_str());
            }
        }
        next.update(patch);
        next.remove(ENTITY_REVISION);
        next.remove(ENTITY_TTL);
        next.remove(ATTR_SESSION);
        if let Some(created) = base.created_at() {
            next.set_created_at(created);
        }
        let now = Utc::now();
        next.set_updated_at(base.updated_at().map_or(now, |prev| prev.max(now)));

        let next = self.validator().validate_entity(next).await?;

        // Re-check the revision at commit time.
        {
            let state = self.state.lock();
            if let Some(stored) = state.entities.get(id.as_str()) {
                if stored.revision != current_revision {
                    return Err(StoreError::conflict(id, "revision changed under write"));
                }
            }
        }
        self.commit(id, next, &opts, false).await
    }

    async fn patch(&self, entity: Entity, opts: WriteOptions) -> Result<Entity> {
        let id = entity.id().cloned().ok_or_else(|| {
            StoreError::Validation(
                ValidationError::Invalid {
                    id: Id::new(DB_ID),
                    reason: "patch requires db/id".to_string(),
                }
                .into(),
            )
        })?;
        let mut opts = opts;
        if opts.from_revision.is_none() && entity.revision() != 0 {
            opts.from_revision = Some(entity.revision());
        }
        let mut attrs = entity.into_attrs();
        attrs.retain(|a| {
            !matches!(
                a.id.as_str(),
                DB_ID
                    | ENTITY_REVISION
                    | "db/entity.created-at"
                    | "db/entity.updated-at"
                    | ENTITY_TTL
                    | ATTR_SESSION
            )
        });
        self.update(&id, attrs, opts).await
    }

    async fn replace(&self, entity: Entity, opts: WriteOptions) -> Result<Entity> {
        let id = entity.id().cloned().ok_or_else(|| {
            StoreError::Validation(
                ValidationError::Invalid {
                    id: Id::new(DB_ID),
                    reason: "replace requires db/id".to_string(),
                }
                .into(),
            )
        })?;
        let (created_at, updated_at, current_revision) = {
            let state = self.state.lock();
            let Some(stored) = state.entities.get(id.as_str()) else {
                return Err(StoreError::NotFound(id.clone()));
            };
            (
                stored.primary.created_at(),
                stored.primary.updated_at(),
                stored.revision,
            )
        };
        let expected = opts
            .from_revision
            .or_else(|| (entity.revision() != 0).then(|| entity.revision()))
            .unwrap_or(current_revision);
        if expected != current_revision {
            return Err(StoreError::conflict(
                &id,
                format!("expected revision {expected}, found {current_revision}"),
            ));
        }
        let mut next = entity;
        next.remove(ENTITY_REVISION);
        next.remove(ENTITY_TTL);
        next.remove(ATTR_SESSION);
        if let Some(created) = created_at {
            next.set_created_at(created);
        }
        let now = Utc::now();
        next.set_updated_at(updated_at.map_or(now, |prev| prev.max(now)));
        let next = self.validator().validate_entity(next).await?;
        self.commit(&id, next, &opts, false).await
    }

    async fn delete(&self, id: &Id) -> Result<()> {
        let prev = {
            let state = self.state.lock();
            state.entities.get(id.as_str()).cloned()
        };
        let Some(prev) = prev else {
            return Ok(());
        };
        let assembled = Self::assemble(&prev);
        let indexed = self.indexed_attrs(&assembled).await?;

        let mut state = self.state.lock();
        state.entities.remove(id.as_str());
        state.revision += 1;
        let revision = state.revision;
        let keys = self.keys.clone();
        for attr in &indexed {
            Self::dispatch_index_event(
                &mut state,
                &keys,
                &attr.cas(),
                id,
                None,
                KvEventKind::Delete,
                revision,
            );
        }
        Self::dispatch_entity_event(
            &mut state,
            EntityEvent {
                op: EntityOp::Deleted,
                id: id.clone(),
                revision,
                entity: None,
            },
        );
        Ok(())
    }

    async fn list_index(&self, attr: &Attr) -> Result<Vec<Id>> {
        if let Some(hook) = self.on_list_index.lock().as_ref() {
            if let Some(result) = hook(attr) {
                return result;
            }
        }
        if attr.id.as_str() == DB_ID {
            let Some(target) = attr.value.as_id() else {
                return Ok(vec![]);
            };
            let state = self.state.lock();
            return Ok(if state.entities.contains_key(target.as_str()) {
                vec![target.clone()]
            } else {
                vec![]
            });
        }

        let schema = self.registry.resolve(&attr.id, self).await?;
        if !schema.index {
            return Err(StoreError::Validation(
                ValidationError::Invalid {
                    id: attr.id.clone(),
                    reason: "attribute is not indexed".to_string(),
                }
                .into(),
            ));
        }
        let state = self.state.lock();
        let mut ids = Vec::new();
        for (id, stored) in &state.entities {
            if Self::contains(&Self::assemble(stored), attr) {
                ids.push(Id::new(id.clone()));
            }
        }
        Ok(ids)
    }

    async fn watch_entity(&self, id: &Id) -> Result<EntityWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (bridge_tx, bridge_rx) = mpsc::channel(64);
        {
            let mut state = self.state.lock();
            if let Some(stored) = state.entities.get(id.as_str()) {
                let assembled = Self::assemble(stored);
                let _ = tx.send(EntityEvent {
                    op: EntityOp::Stated,
                    id: id.clone(),
                    revision: stored.revision,
                    entity: Some(assembled),
                });
            }
            state.entity_watchers.push(EntityWatcher {
                id: id.as_str().to_string(),
                tx,
            });
        }
        let mut rx = rx;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if bridge_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(EntityWatch::new(bridge_rx))
    }

    async fn watch_index(&self, attr: &Attr) -> Result<KvWatch> {
        if attr.id.as_str() != DB_ID {
            let schema = self.registry.resolve(&attr.id, self).await?;
            if !schema.index {
                return Err(StoreError::Validation(
                    ValidationError::Invalid {
                        id: attr.id.clone(),
                        reason: "attribute is not indexed".to_string(),
                    }
                    .into(),
                ));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.index_watchers.push(IndexWatcher {
            cas: attr.cas(),
            tx,
        });
        Ok(KvWatch::new(rx))
    }

    async fn create_session(&self, _ttl: Duration) -> Result<SessionId> {
        let mut state = self.state.lock();
        let lease = state.next_session;
        state.next_session += 1;
        state.live_sessions.insert(lease);
        Ok(SessionId::from_lease(lease))
    }

    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        let lease = session.lease()?;
        let mut state = self.state.lock();
        state.live_sessions.remove(&lease);
        state.revision += 1;
        let revision = state.revision;
        let keys = self.keys.clone();

        let ids: Vec<String> = state.entities.keys().cloned().collect();
        for id in ids {
            let Some(stored) = state.entities.get_mut(&id) else {
                continue;
            };
            let entity_id = Id::new(id.clone());
            if stored.bound_session == Some(lease) {
                // The primary record's lifetime was bound to the lease.
                let assembled = Self::assemble(stored);
                let cas_set: HashSet<String> =
                    Self::enumerate(&assembled).iter().map(Attr::cas).collect();
                state.entities.remove(&id);
                for cas in cas_set {
                    Self::dispatch_index_event(
                        &mut state,
                        &keys,
                        &cas,
                        &entity_id,
                        None,
                        KvEventKind::Delete,
                        revision,
                    );
                }
                Self::dispatch_entity_event(
                    &mut state,
                    EntityEvent {
                        op: EntityOp::Deleted,
                        id: entity_id,
                        revision,
                        entity: None,
                    },
                );
                continue;
            }
            if let Some(slice) = stored.sessions.remove(&lease) {
                stored.revision = revision;
                for cas in slice.index_cas {
                    Self::dispatch_index_event(
                        &mut state,
                        &keys,
                        &cas,
                        &entity_id,
                        Some(lease),
                        KvEventKind::Delete,
                        revision,
                    );
                }
            }
        }
        Ok(())
    }

    async fn ping_session(&self, session: &SessionId) -> Result<()> {
        let lease = session.lease()?;
        if !self.state.lock().live_sessions.contains(&lease) {
            return Err(StoreError::Transport(format!("lease {lease} not found")));
        }
        Ok(())
    }

    async fn list_session_entities(&self, session: &SessionId) -> Result<Vec<Id>> {
        let lease = session.lease()?;
        let state = self.state.lock();
        Ok(state
            .entities
            .iter()
            .filter(|(_, stored)| {
                stored.bound_session == Some(lease) || stored.sessions.contains_key(&lease)
            })
            .map(|(id, _)| Id::new(id.clone()))
            .collect())
    }

    async fn attribute_schema(&self, id: &Id) -> Result<Arc<AttributeSchema>> {
        self.registry.resolve(id, self).await
    }
}
