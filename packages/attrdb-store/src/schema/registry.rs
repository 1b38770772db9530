//! Process-wide resolution of attribute schemas, with a bounded LRU over the
//! hot path and a compiled-predicate cache.

use super::pred::{Program, ProgramCache};
use super::{builtin, AttributeSchema, DB_PROGRAM};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use attrdb_types::{Entity, Id, Value};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Raw entity lookup used during schema resolution and ref validation.
/// Implemented by the store itself (primary records only) and by the mock.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    async fn fetch(&self, id: &Id) -> Result<Option<Entity>>;
}

pub struct SchemaRegistry {
    attrs: RwLock<LruCache<Id, Arc<AttributeSchema>>>,
    programs: ProgramCache,
}

impl SchemaRegistry {
    /// `capacity` is clamped to at least 100 entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(100)).expect("clamped capacity is non-zero");
        SchemaRegistry {
            attrs: RwLock::new(LruCache::new(capacity)),
            programs: ProgramCache::new(),
        }
    }

    /// Resolves the schema for an attribute id: builtin, then cache, then a
    /// lookup of the schema entity through `fetcher`.
    pub async fn resolve(
        &self,
        id: &Id,
        fetcher: &dyn EntityFetcher,
    ) -> Result<Arc<AttributeSchema>> {
        if let Some(schema) = self.attrs.read().peek(id) {
            return Ok(schema.clone());
        }
        if let Some(schema) = builtin(id.as_str()) {
            let schema = Arc::new(schema);
            self.attrs.write().push(id.clone(), schema.clone());
            return Ok(schema);
        }
        let entity = fetcher
            .fetch(id)
            .await?
            .ok_or_else(|| StoreError::SchemaNotFound(id.clone()))?;
        let schema = Arc::new(AttributeSchema::decode(&entity)?);
        self.attrs.write().push(id.clone(), schema.clone());
        Ok(schema)
    }

    /// Resolves and compiles the program attached to a predicate entity.
    pub async fn predicate(
        &self,
        pred_id: &Id,
        fetcher: &dyn EntityFetcher,
    ) -> Result<Arc<Program>> {
        let entity = fetcher
            .fetch(pred_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(pred_id.clone()))?;
        let source = entity
            .get_value(DB_PROGRAM)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::NotFound(pred_id.clone()))?;
        self.programs
            .get_or_compile(source)
            .map_err(|e| StoreError::Transport(format!("predicate {pred_id}: {e}")))
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }
}
