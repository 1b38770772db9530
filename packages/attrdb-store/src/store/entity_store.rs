//! KV-backed store: every write validates against schemas, encodes CBOR
//! records, and commits the primary record, session sidecars, and all
//! affected index-collection entries in a single transaction.

use super::{
    EntityEvent, EntityOp, EntityWatch, SessionId, Store, WriteOptions, MAX_ENTITIES_PER_BATCH,
};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError, ValidationError};
use crate::keys::KeySpace;
use crate::kv::{Compare, Kv, KvEvent, KvEventKind, KvWatch, KeyValue, TxnOp};
use crate::schema::registry::EntityFetcher;
use crate::schema::{AttributeSchema, Cardinality, SchemaRegistry};
use crate::validate::Validator;
use async_trait::async_trait;
use attrdb_types::codec;
use attrdb_types::entity::{ATTR_SESSION, DB_ID, ENTITY_CREATED_AT, ENTITY_REVISION, ENTITY_TTL, ENTITY_UPDATED_AT};
use attrdb_types::{Attr, Entity, Id, Value};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct EntityStore<K: Kv> {
    kv: Arc<K>,
    keys: KeySpace,
    registry: Arc<SchemaRegistry>,
    config: StoreConfig,
}

impl<K: Kv> EntityStore<K> {
    pub fn new(kv: Arc<K>, config: StoreConfig) -> Self {
        EntityStore {
            keys: KeySpace::new(config.prefix.clone()),
            registry: Arc::new(SchemaRegistry::new(config.schema_cache_entries)),
            kv,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keys
    }

    fn validator(&self) -> Validator<'_> {
        Validator::new(&self.registry, self)
    }

    fn decode_record(&self, kv: &KeyValue) -> Result<Entity> {
        let mut entity = codec::decode_entity(&kv.value).map_err(|e| StoreError::Corruption {
            key: kv.key.clone(),
            source: e,
        })?;
        entity.set_revision(kv.mod_revision);
        Ok(entity)
    }

    /// Atomically reads the primary record and every session sidecar,
    /// returning the assembled entity and the primary mod-revision.
    async fn read(&self, id: &Id) -> Result<Option<(Entity, i64)>> {
        let entity_key = self.keys.entity(id);
        let resp = self
            .kv
            .txn(
                vec![],
                vec![
                    TxnOp::Get {
                        key: entity_key.clone(),
                    },
                    TxnOp::GetPrefix {
                        prefix: self.keys.sidecar_prefix(id),
                    },
                ],
                vec![],
            )
            .await?;
        let Some(primary) = resp.results.first().and_then(|r| r.range().first()).cloned() else {
            return Ok(None);
        };
        let sidecars: Vec<KeyValue> = resp
            .results
            .get(1)
            .map(|r| r.range().to_vec())
            .unwrap_or_default();
        let entity = self.assemble(&primary, &sidecars).await?;
        Ok(Some((entity, primary.mod_revision)))
    }

    async fn assemble(&self, primary: &KeyValue, sidecars: &[KeyValue]) -> Result<Entity> {
        let mut entity = self.decode_record(primary)?;
        if primary.lease != 0 {
            let info = self.kv.lease_info(primary.lease).await?;
            entity.set_ttl(info.remaining);
        }
        for sidecar in sidecars {
            let attrs = self.decode_record(sidecar)?.into_attrs();
            entity.update(
                attrs
                    .into_iter()
                    .filter(|a| a.id.as_str() != ENTITY_REVISION),
            );
            if let Some(session) = self.keys.session_from_sidecar_key(&sidecar.key) {
                entity.add(Attr::new(ATTR_SESSION, Value::Bytes(session)));
            }
        }
        codec::post_unmarshal(&mut entity);
        entity.set_revision(primary.mod_revision);
        Ok(entity)
    }

    async fn schema_of(&self, id: &Id) -> Result<Option<Arc<AttributeSchema>>> {
        match self.registry.resolve(id, self).await {
            Ok(schema) => Ok(Some(schema)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Splits a validated entity into the primary record and the
    /// session-flagged attributes that live only in sidecars.
    async fn split_session(&self, entity: &Entity) -> Result<(Entity, Vec<Attr>)> {
        let mut primary = Vec::new();
        let mut session = Vec::new();
        for attr in entity.attrs() {
            let is_session = self
                .schema_of(&attr.id)
                .await?
                .map_or(false, |s| s.session);
            if is_session {
                session.push(attr.clone());
            } else {
                primary.push(attr.clone());
            }
        }
        Ok((Entity::from_attrs(primary), session))
    }

    /// All indexed attributes of an entity, nested component fragments
    /// included, each tagged with its schema's session flag.
    async fn collect_indexed(&self, entity: &Entity) -> Result<Vec<(Attr, bool)>> {
        let mut out: Vec<(Attr, bool)> = Vec::new();
        let mut queue: Vec<Attr> = entity.attrs().to_vec();
        while let Some(attr) = queue.pop() {
            if let Some(schema) = self.schema_of(&attr.id).await? {
                if schema.index {
                    out.push((attr.clone(), schema.session));
                }
            }
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
        }
        out.sort_by(|a, b| a.0.compare(&b.0));
        out.dedup_by(|a, b| a.0 == b.0);
        Ok(out)
    }

    fn effective_session(opts: &WriteOptions) -> Option<&SessionId> {
        opts.session.as_ref().or(opts.bind_to_session.as_ref())
    }

    /// Put operations for a freshly validated entity: primary record, index
    /// entries, and session sidecar.
    async fn write_ops(
        &self,
        id: &Id,
        entity: &Entity,
        opts: &WriteOptions,
    ) -> Result<Vec<TxnOp>> {
        let (primary, session_attrs) = self.split_session(entity).await?;
        let bind_lease = match &opts.bind_to_session {
            Some(s) => s.lease()?,
            None => 0,
        };
        let session = Self::effective_session(opts);
        let session_lease = match session {
            Some(s) => s.lease()?,
            None => 0,
        };

        let mut record = primary.clone();
        record.remove(ENTITY_REVISION);
        let value = codec::encode_entity(&record).map_err(|e| StoreError::Corruption {
            key: self.keys.entity(id),
            source: e,
        })?;
        let mut ops = vec![TxnOp::Put {
            key: self.keys.entity(id),
            value,
            lease: bind_lease,
        }];

        for (attr, is_session) in self.collect_indexed(entity).await? {
            let cas = attr.cas();
            if !is_session {
                ops.push(TxnOp::Put {
                    key: self.keys.index_entry(&cas, id),
                    value: id.as_str().as_bytes().to_vec(),
                    lease: bind_lease,
                });
            }
            if let Some(session) = session {
                ops.push(TxnOp::Put {
                    key: self.keys.session_index_entry(&cas, id, session.as_bytes()),
                    value: id.as_str().as_bytes().to_vec(),
                    lease: session_lease,
                });
            }
        }

        if !session_attrs.is_empty() {
            if let Some(session) = session {
                let sidecar = Entity::from_attrs(session_attrs);
                let value = codec::encode_entity(&sidecar).map_err(|e| {
                    StoreError::Corruption {
                        key: self.keys.sidecar(id, session.as_bytes()),
                        source: e,
                    }
                })?;
                ops.push(TxnOp::Put {
                    key: self.keys.sidecar(id, session.as_bytes()),
                    value,
                    lease: session_lease,
                });
            }
        }
        Ok(ops)
    }

    /// Shared guts of update/replace: validate the next state, diff indexed
    /// attributes against the previous state, and commit guarded on the
    /// primary's mod-revision.
    async fn commit_next(
        &self,
        id: &Id,
        previous: &Entity,
        next: Entity,
        expected_revision: i64,
        opts: &WriteOptions,
    ) -> Result<Entity> {
        let mut next = next;
        next.remove(ENTITY_REVISION);
        next.remove(ENTITY_TTL);
        next.remove(ATTR_SESSION);

        // created-at is set on first write and preserved thereafter;
        // updated-at never moves backwards.
        if let Some(created) = previous.created_at() {
            next.set_created_at(created);
        }
        let now = Utc::now();
        let updated = previous.updated_at().map_or(now, |prev| prev.max(now));
        next.set_updated_at(updated);

        let next = self.validator().validate_entity(next).await?;

        let prev_indexed = self.collect_indexed(previous).await?;
        let new_indexed = self.collect_indexed(&next).await?;
        let new_cas: HashSet<String> = new_indexed.iter().map(|(a, _)| a.cas()).collect();

        let mut ops = self.write_ops(id, &next, opts).await?;
        for (attr, _) in &prev_indexed {
            let cas = attr.cas();
            if !new_cas.contains(&cas) {
                ops.push(TxnOp::DeletePrefix {
                    prefix: self.keys.index_entry(&cas, id),
                });
            }
        }

        let resp = self
            .kv
            .txn(
                vec![Compare::ModRevision {
                    key: self.keys.entity(id),
                    revision: expected_revision,
                }],
                ops,
                vec![],
            )
            .await?;
        if !resp.succeeded {
            return Err(StoreError::conflict(id, "revision changed under write"));
        }
        let mut out = next;
        out.set_revision(resp.revision);
        Ok(out)
    }

    fn strip_bookkeeping(attrs: &mut Vec<Attr>) {
        attrs.retain(|a| {
            !matches!(
                a.id.as_str(),
                DB_ID | ENTITY_REVISION | ENTITY_CREATED_AT | ENTITY_UPDATED_AT | ENTITY_TTL
                    | ATTR_SESSION
            )
        });
    }
}

#[async_trait]
impl<K: Kv> EntityFetcher for EntityStore<K> {
    async fn fetch(&self, id: &Id) -> Result<Option<Entity>> {
        let key = self.keys.entity(id);
        match self.kv.get(&key).await? {
            None => Ok(None),
            Some(kv) => Ok(Some(self.decode_record(&kv)?)),
        }
    }
}

#[async_trait]
impl<K: Kv> Store for EntityStore<K> {
    async fn get(&self, id: &Id) -> Result<Entity> {
        match self.read(id).await? {
            Some((entity, _)) => Ok(entity),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn get_batch(&self, ids: &[Id]) -> Result<Vec<Option<Entity>>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_ENTITIES_PER_BATCH) {
            let mut ops = Vec::with_capacity(chunk.len() * 2);
            for id in chunk {
                ops.push(TxnOp::Get {
                    key: self.keys.entity(id),
                });
                ops.push(TxnOp::GetPrefix {
                    prefix: self.keys.sidecar_prefix(id),
                });
            }
            let resp = self.kv.txn(vec![], ops, vec![]).await?;
            for (i, _id) in chunk.iter().enumerate() {
                let primary = resp
                    .results
                    .get(i * 2)
                    .and_then(|r| r.range().first())
                    .cloned();
                match primary {
                    None => out.push(None),
                    Some(primary) => {
                        let sidecars = resp
                            .results
                            .get(i * 2 + 1)
                            .map(|r| r.range().to_vec())
                            .unwrap_or_default();
                        out.push(Some(self.assemble(&primary, &sidecars).await?));
                    }
                }
            }
        }
        Ok(out)
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

        let entity_key = self.keys.entity(&id);
        let ops = self.write_ops(&id, &entity, &opts).await?;
        let resp = self
            .kv
            .txn(
                vec![Compare::CreateRevision {
                    key: entity_key.clone(),
                    revision: 0,
                }],
                ops.clone(),
                vec![TxnOp::Get { key: entity_key }],
            )
            .await?;
        if resp.succeeded {
            let mut out = entity;
            out.set_revision(resp.revision);
            return Ok(out);
        }

        // Identity conflict: equal attributes count as success.
        if let Some(current_kv) = resp.results.first().and_then(|r| r.range().first()) {
            let current = self.decode_record(current_kv)?;
            let (primary, _) = self.split_session(&entity).await?;
            if current.timeless() == primary.timeless() {
                let mut out = current;
                out.set_revision(current_kv.mod_revision);
                return Ok(out);
            }
        }
        if opts.overwrite {
            let resp = self.kv.txn(vec![], ops, vec![]).await?;
            let mut out = entity;
            out.set_revision(resp.revision);
            return Ok(out);
        }
        Err(StoreError::conflict(
            &id,
            "entity exists with different attributes",
        ))
    }

    async fn ensure(&self, entity: Entity, opts: WriteOptions) -> Result<(Entity, bool)> {
        if let Some(id) = entity.id().cloned() {
            if let Some((existing, _)) = self.read(&id).await? {
                return Ok((existing, false));
            }
        }
        match self.create(entity.clone(), opts).await {
            Ok(created) => Ok((created, true)),
            Err(err) if err.is_conflict() => {
                // Lost a concurrent create; the other writer wins.
                let id = entity
                    .id()
                    .cloned()
                    .ok_or_else(|| StoreError::conflict(&Id::new("?"), "racing create"))?;
                let entity = self.get(&id).await?;
                Ok((entity, false))
            }
            Err(err) => Err(err),
        }
    }

    async fn update(&self, id: &Id, patch: Vec<Attr>, opts: WriteOptions) -> Result<Entity> {
        let entity_key = self.keys.entity(id);
        let resp = self
            .kv
            .txn(
                vec![],
                vec![
                    TxnOp::Get {
                        key: entity_key.clone(),
                    },
                    TxnOp::GetPrefix {
                        prefix: self.keys.sidecar_prefix(id),
                    },
                ],
                vec![],
            )
            .await?;
        let Some(primary_kv) = resp.results.first().and_then(|r| r.range().first()).cloned()
        else {
            return Err(StoreError::NotFound(id.clone()));
        };
        let current_revision = primary_kv.mod_revision;
        if let Some(expected) = opts.from_revision {
            if expected != current_revision {
                return Err(StoreError::conflict(
                    id,
                    format!("expected revision {expected}, found {current_revision}"),
                ));
            }
        }

        // Base state: the primary record plus this session's sidecar. Other
        // sessions' transient attributes stay in their own sidecars.
        let mut base = self.decode_record(&primary_kv)?;
        if let Some(session) = Self::effective_session(&opts) {
            let our_sidecar = self.keys.sidecar(id, session.as_bytes());
            if let Some(sidecar_kv) = resp
                .results
                .get(1)
                .and_then(|r| r.range().iter().find(|kv| kv.key == our_sidecar))
            {
                let attrs = self.decode_record(sidecar_kv)?.into_attrs();
                base.update(
                    attrs
                        .into_iter()
                        .filter(|a| a.id.as_str() != ENTITY_REVISION),
                );
            }
        }
        codec::post_unmarshal(&mut base);

        // The patch replaces cardinality-one attributes and appends the rest.
        let mut next = base.clone();
        for attr in &patch {
            let replaces = self
                .schema_of(&attr.id)
                .await?
                .map_or(true, |s| s.cardinality == Cardinality::One);
            if replaces {
                next.remove(attr.id.as_str());
            }
        }
        next.update(patch);

        self.commit_next(id, &base, next, current_revision, &opts).await
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
        Self::strip_bookkeeping(&mut attrs);
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
        let Some((current, current_revision)) = self.read(&id).await? else {
            return Err(StoreError::NotFound(id.clone()));
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
        self.commit_next(&id, &current, entity, current_revision, &opts)
            .await
    }

    async fn delete(&self, id: &Id) -> Result<()> {
        let Some((current, current_revision)) = self.read(id).await? else {
            return Ok(());
        };
        let mut ops = Vec::new();
        for (attr, _) in self.collect_indexed(&current).await? {
            ops.push(TxnOp::DeletePrefix {
                prefix: self.keys.index_entry(&attr.cas(), id),
            });
        }
        ops.push(TxnOp::DeletePrefix {
            prefix: self.keys.sidecar_prefix(id),
        });
        ops.push(TxnOp::Delete {
            key: self.keys.entity(id),
        });
        let resp = self
            .kv
            .txn(
                vec![Compare::ModRevision {
                    key: self.keys.entity(id),
                    revision: current_revision,
                }],
                ops,
                vec![],
            )
            .await?;
        if !resp.succeeded {
            return Err(StoreError::conflict(id, "revision changed under delete"));
        }
        Ok(())
    }

    async fn list_index(&self, attr: &Attr) -> Result<Vec<Id>> {
        if attr.id.as_str() == DB_ID {
            let Some(target) = attr.value.as_id() else {
                return Err(StoreError::Validation(
                    ValidationError::WrongType {
                        id: attr.id.clone(),
                        expected: "ref".to_string(),
                        got: attr.value.kind().name().to_string(),
                    }
                    .into(),
                ));
            };
            return Ok(match self.read(target).await? {
                Some(_) => vec![target.clone()],
                None => vec![],
            });
        }

        let schema = self
            .registry
            .resolve(&attr.id, self)
            .await?;
        if !schema.index {
            return Err(StoreError::Validation(
                ValidationError::Invalid {
                    id: attr.id.clone(),
                    reason: "attribute is not indexed".to_string(),
                }
                .into(),
            ));
        }
        let kvs = self
            .kv
            .get_prefix(&self.keys.index_prefix(&attr.cas()))
            .await?;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for kv in kvs {
            if let Some(id) = self.keys.entity_id_from_index_key(&kv.key) {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn watch_entity(&self, id: &Id) -> Result<EntityWatch> {
        let entity_key = self.keys.entity(id);
        let mut kv_watch = self.kv.watch(&entity_key, false, true).await?;
        let (tx, rx) = mpsc::channel(self.config.watch_buffer.max(1));

        // Initial state, delivered as a synthetic event.
        if let Some((entity, revision)) = self.read(id).await? {
            let _ = tx
                .send(EntityEvent {
                    op: EntityOp::Stated,
                    id: id.clone(),
                    revision,
                    entity: Some(entity),
                })
                .await;
        }

        let id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = kv_watch.recv().await {
                let mapped = match event.kind {
                    KvEventKind::Delete => EntityEvent {
                        op: EntityOp::Deleted,
                        id: id.clone(),
                        revision: event.kv.mod_revision,
                        entity: None,
                    },
                    KvEventKind::Put => {
                        let op = if event.kv.create_revision == event.kv.mod_revision {
                            EntityOp::Created
                        } else {
                            EntityOp::Updated
                        };
                        match codec::decode_entity(&event.kv.value) {
                            Ok(mut entity) => {
                                entity.set_revision(event.kv.mod_revision);
                                EntityEvent {
                                    op,
                                    id: id.clone(),
                                    revision: event.kv.mod_revision,
                                    entity: Some(entity),
                                }
                            }
                            Err(err) => {
                                tracing::warn!(
                                    entity = %id,
                                    error = %err,
                                    "dropping undecodable watch event"
                                );
                                continue;
                            }
                        }
                    }
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });
        Ok(EntityWatch::new(rx))
    }

    async fn watch_index(&self, attr: &Attr) -> Result<KvWatch> {
        if attr.id.as_str() == DB_ID {
            let Some(target) = attr.value.as_id().cloned() else {
                return Err(StoreError::Validation(
                    ValidationError::WrongType {
                        id: attr.id.clone(),
                        expected: "ref".to_string(),
                        got: attr.value.kind().name().to_string(),
                    }
                    .into(),
                ));
            };
            // Synthesize a single-entity watch that yields canonical index
            // events carrying the referenced id.
            let mut inner = self
                .kv
                .watch(&self.keys.entity(&target), false, true)
                .await?;
            let synthetic_key = self.keys.index_entry(&attr.cas(), &target);
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = inner.recv().await {
                    let mapped = KvEvent {
                        kind: event.kind,
                        kv: KeyValue {
                            key: synthetic_key.clone(),
                            value: target.as_str().as_bytes().to_vec(),
                            create_revision: event.kv.create_revision,
                            mod_revision: event.kv.mod_revision,
                            lease: 0,
                        },
                        prev: None,
                    };
                    if tx.send(mapped).is_err() {
                        break;
                    }
                }
            });
            return Ok(KvWatch::new(rx));
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
        self.kv
            .watch(&self.keys.index_prefix(&attr.cas()), true, true)
            .await
    }

    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        let ttl = if ttl.is_zero() {
            self.config.default_session_ttl()
        } else {
            ttl
        };
        let lease = self.kv.lease_grant(ttl).await?;
        Ok(SessionId::from_lease(lease))
    }

    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.kv.lease_revoke(session.lease()?).await
    }

    async fn ping_session(&self, session: &SessionId) -> Result<()> {
        self.kv.lease_keep_alive(session.lease()?).await
    }

    async fn list_session_entities(&self, session: &SessionId) -> Result<Vec<Id>> {
        let info = self.kv.lease_info(session.lease()?).await?;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for key in info.keys {
            let id = self
                .keys
                .entity_id_from_entity_key(&key)
                .or_else(|| self.keys.entity_id_from_index_key(&key));
            if let Some(id) = id {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn attribute_schema(&self, id: &Id) -> Result<Arc<AttributeSchema>> {
        self.registry.resolve(id, self).await
    }
}
