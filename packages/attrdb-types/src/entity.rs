use crate::attr::Attr;
use crate::id::Id;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

/// Entity identity.
pub const DB_ID: &str = "db/id";
/// Legacy identity attribute, migrated to [`DB_ID`] on decode.
pub const DB_IDENT: &str = "db/ident";
/// Monotonic revision stamped from the KV.
pub const ENTITY_REVISION: &str = "db/entity.revision";
/// First-write timestamp.
pub const ENTITY_CREATED_AT: &str = "db/entity.created-at";
/// Last-write timestamp.
pub const ENTITY_UPDATED_AT: &str = "db/entity.updated-at";
/// Remaining lease TTL for session-bound entities.
pub const ENTITY_TTL: &str = "db/entity.ttl";
/// Domain kind reference (cardinality many).
pub const ENTITY_KIND: &str = "entity/kind";
/// Reference to the schema descriptor entity.
pub const ENTITY_SCHEMA: &str = "entity/schema";
/// Session identifier a transient attribute was written under.
pub const ATTR_SESSION: &str = "db/attr.session";
/// Required-attribute-set marker consumed by `Ensure` validation.
pub const DB_ENSURE: &str = "db/ensure";

/// An ordered multiset of attributes with duplicates collapsed.
///
/// Every public mutation leaves the attribute list in canonical order
/// (see [`Attr::compare`]) with exact `(id, value)` duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    attrs: Vec<Attr>,
}

impl Entity {
    pub fn new() -> Self {
        Entity { attrs: Vec::new() }
    }

    pub fn from_attrs(attrs: Vec<Attr>) -> Self {
        let mut e = Entity { attrs };
        e.normalize();
        e
    }

    /// Builder-style append.
    pub fn with(mut self, id: impl Into<Id>, value: impl Into<Value>) -> Self {
        self.add(Attr::new(id, value));
        self
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    pub fn into_attrs(self) -> Vec<Attr> {
        self.attrs
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// First attribute with the given id.
    pub fn get(&self, id: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.id.as_str() == id)
    }

    /// First value with the given id.
    pub fn get_value(&self, id: &str) -> Option<&Value> {
        self.get(id).map(|a| &a.value)
    }

    /// All attributes with the given id, in canonical order.
    pub fn get_all(&self, id: &str) -> Vec<&Attr> {
        self.attrs.iter().filter(|a| a.id.as_str() == id).collect()
    }

    /// Replaces every attribute with the same id by `attr`. Returns true if
    /// something was replaced.
    pub fn set(&mut self, attr: Attr) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.id != attr.id);
        let replaced = self.attrs.len() != before;
        self.attrs.push(attr);
        self.normalize();
        replaced
    }

    /// Appends an attribute, keeping exact duplicates collapsed.
    pub fn add(&mut self, attr: Attr) {
        self.attrs.push(attr);
        self.normalize();
    }

    /// Removes an exact `(id, value)` pair. Returns true if it was present.
    pub fn remove_exact(&mut self, attr: &Attr) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a != attr);
        self.attrs.len() != before
    }

    /// Removes every attribute with the given id. Returns true if any was
    /// present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.id.as_str() != id);
        self.attrs.len() != before
    }

    /// Appends all attributes, then restores the canonical order.
    pub fn update(&mut self, attrs: impl IntoIterator<Item = Attr>) {
        self.attrs.extend(attrs);
        self.normalize();
    }

    /// Merges `other` into `self`: the existing `created-at` wins, the
    /// existing revision wins when non-zero, the other side's `updated-at`
    /// is always adopted, and every remaining attribute is appended.
    pub fn merge(&mut self, other: &Entity) {
        let keep_created = self.created_at().is_some();
        let keep_revision = self.revision() != 0;
        for attr in other.attrs() {
            match attr.id.as_str() {
                ENTITY_CREATED_AT => {
                    if !keep_created {
                        self.set(attr.clone());
                    }
                }
                ENTITY_REVISION => {
                    if !keep_revision {
                        self.set(attr.clone());
                    }
                }
                ENTITY_UPDATED_AT => {
                    self.set(attr.clone());
                }
                _ => self.attrs.push(attr.clone()),
            }
        }
        self.normalize();
    }

    /// Elementwise comparison under the canonical attribute order.
    pub fn compare(&self, other: &Entity) -> Ordering {
        for (a, b) in self.attrs.iter().zip(&other.attrs) {
            match a.compare(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.attrs.len().cmp(&other.attrs.len())
    }

    /// Attributes present in `self` but not in `other`, and vice versa.
    pub fn diff<'a>(&'a self, other: &'a Entity) -> (Vec<&'a Attr>, Vec<&'a Attr>) {
        let added = self
            .attrs
            .iter()
            .filter(|a| !other.attrs.contains(a))
            .collect();
        let removed = other
            .attrs
            .iter()
            .filter(|a| !self.attrs.contains(a))
            .collect();
        (added, removed)
    }

    pub fn id(&self) -> Option<&Id> {
        self.get_value(DB_ID).and_then(Value::as_id)
    }

    pub fn set_id(&mut self, id: impl Into<Id>) {
        self.set(Attr::new(DB_ID, Value::Id(id.into())));
    }

    /// Sets `db/id` to `{prefix}-{fresh opaque id}` and returns it.
    pub fn force_id(&mut self, prefix: &str) -> Id {
        let id = Id::new(format!("{prefix}-{}", Uuid::new_v4().simple()));
        self.set_id(id.clone());
        id
    }

    /// Revision from the KV, or 0 when never written.
    pub fn revision(&self) -> i64 {
        self.get_value(ENTITY_REVISION)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn set_revision(&mut self, revision: i64) {
        self.set(Attr::new(ENTITY_REVISION, Value::Int(revision)));
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.get_value(ENTITY_CREATED_AT).and_then(Value::as_time)
    }

    pub fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.set(Attr::new(ENTITY_CREATED_AT, Value::Time(at)));
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.get_value(ENTITY_UPDATED_AT).and_then(Value::as_time)
    }

    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.set(Attr::new(ENTITY_UPDATED_AT, Value::Time(at)));
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.get_value(ENTITY_TTL).and_then(Value::as_duration)
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.set(Attr::new(ENTITY_TTL, Value::Duration(ttl)));
    }

    /// All `entity/kind` references, in canonical order.
    pub fn kinds(&self) -> Vec<&Id> {
        self.get_all(ENTITY_KIND)
            .into_iter()
            .filter_map(|a| a.value.as_id())
            .collect()
    }

    /// A copy without revision or timestamps.
    pub fn timeless(&self) -> Entity {
        let mut e = self.clone();
        e.remove(ENTITY_REVISION);
        e.remove(ENTITY_CREATED_AT);
        e.remove(ENTITY_UPDATED_AT);
        e
    }

    fn normalize(&mut self) {
        self.attrs.sort();
        self.attrs.dedup();
    }
}
