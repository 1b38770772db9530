//! Encoded domain schemas: gzip-compressed CBOR blobs stored on a schema
//! entity's `db/schema` attribute, describing the natural-document fields of
//! every kind in a domain.

use super::registry::EntityFetcher;
use super::DB_SCHEMA;
use crate::error::{Result, StoreError};
use attrdb_types::entity::ENTITY_SCHEMA;
use attrdb_types::{Id, Value};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// One natural-document field of a kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub id: String,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub component: Option<Vec<EncodedField>>,
}

impl EncodedField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>, id: impl Into<String>) -> Self {
        EncodedField {
            name: name.into(),
            field_type: field_type.into(),
            id: id.into(),
            many: false,
            enum_values: Vec::new(),
            component: None,
        }
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_component(mut self, fields: Vec<EncodedField>) -> Self {
        self.component = Some(fields);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedKind {
    pub kind: String,
    pub fields: Vec<EncodedField>,
}

/// All kinds of one domain, as stored on the schema entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainSchema {
    pub domain: String,
    pub version: String,
    pub kinds: Vec<EncodedKind>,
}

impl DomainSchema {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut cbor = Vec::new();
        ciborium::ser::into_writer(self, &mut cbor)
            .map_err(|e| StoreError::Transport(format!("schema encode: {e}")))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&cbor)
            .and_then(|()| gz.finish())
            .map_err(|e| StoreError::Transport(format!("schema compress: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let reader = GzDecoder::new(bytes);
        ciborium::de::from_reader(reader).map_err(|e| StoreError::Corruption {
            key: "db/schema".to_string(),
            source: attrdb_types::DataError::Decode(e.to_string()),
        })
    }

    pub fn kind(&self, short: &str) -> Option<&EncodedKind> {
        self.kinds.iter().find(|k| k.kind == short)
    }
}

/// A single kind's schema, resolved out of its domain schema.
#[derive(Debug, Clone, PartialEq)]
pub struct KindSchema {
    pub domain: String,
    pub version: String,
    pub kind: String,
    pub fields: Vec<EncodedField>,
}

impl KindSchema {
    /// The kind id this schema decodes documents into: `{domain}/kind.{kind}`.
    pub fn kind_id(&self) -> Id {
        Id::new(format!("{}/kind.{}", self.domain, self.kind))
    }

    /// The document kind header: `{domain}/{kind}`.
    pub fn document_kind(&self) -> String {
        format!("{}/{}", self.domain, self.kind)
    }
}

/// Bounded cache resolving domain schemas by schema id and kind schemas by
/// kind id (a kind entity names its domain schema via `entity/schema`).
pub struct SchemaCache {
    domains: RwLock<LruCache<Id, Arc<DomainSchema>>>,
    kinds: RwLock<LruCache<Id, Arc<KindSchema>>>,
}

impl SchemaCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(100)).expect("clamped capacity is non-zero");
        SchemaCache {
            domains: RwLock::new(LruCache::new(capacity)),
            kinds: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn domain_schema(
        &self,
        schema_id: &Id,
        fetcher: &dyn EntityFetcher,
    ) -> Result<Arc<DomainSchema>> {
        if let Some(schema) = self.domains.read().peek(schema_id) {
            return Ok(schema.clone());
        }
        let entity = fetcher
            .fetch(schema_id)
            .await?
            .ok_or_else(|| StoreError::SchemaNotFound(schema_id.clone()))?;
        let bytes = entity
            .get_value(DB_SCHEMA)
            .and_then(Value::as_bytes)
            .ok_or_else(|| StoreError::SchemaNotFound(schema_id.clone()))?;
        let schema = Arc::new(DomainSchema::decode(bytes)?);
        self.domains.write().push(schema_id.clone(), schema.clone());
        Ok(schema)
    }

    pub async fn kind_schema(
        &self,
        kind_id: &Id,
        fetcher: &dyn EntityFetcher,
    ) -> Result<Arc<KindSchema>> {
        if let Some(schema) = self.kinds.read().peek(kind_id) {
            return Ok(schema.clone());
        }
        let kind_entity = fetcher
            .fetch(kind_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(kind_id.clone()))?;
        let schema_id = kind_entity
            .get_value(ENTITY_SCHEMA)
            .and_then(Value::as_id)
            .cloned()
            .ok_or_else(|| StoreError::SchemaNotFound(kind_id.clone()))?;
        let domain = self.domain_schema(&schema_id, fetcher).await?;
        let short = kind_id.last_segment();
        let encoded = domain
            .kind(short)
            .ok_or_else(|| StoreError::SchemaNotFound(kind_id.clone()))?;
        let schema = Arc::new(KindSchema {
            domain: domain.domain.clone(),
            version: domain.version.clone(),
            kind: encoded.kind.clone(),
            fields: encoded.fields.clone(),
        });
        self.kinds.write().push(kind_id.clone(), schema.clone());
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_schema_round_trips_through_gzip_cbor() {
        let schema = DomainSchema {
            domain: "miren".to_string(),
            version: "v1".to_string(),
            kinds: vec![EncodedKind {
                kind: "sandbox".to_string(),
                fields: vec![
                    EncodedField::new("image", "string", "sandbox/image"),
                    EncodedField::new("status", "enum", "sandbox/status")
                        .with_enum(&["PENDING", "READY"]),
                    EncodedField::new("container", "component", "sandbox/container")
                        .many()
                        .with_component(vec![EncodedField::new(
                            "image",
                            "string",
                            "container/image",
                        )]),
                ],
            }],
        };
        let bytes = schema.encode().unwrap();
        // Gzip magic header.
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let decoded = DomainSchema::decode(&bytes).unwrap();
        assert_eq!(schema, decoded);
    }

    #[test]
    fn kind_lookup_by_short_name() {
        let schema = DomainSchema {
            domain: "miren".to_string(),
            version: "v1".to_string(),
            kinds: vec![EncodedKind {
                kind: "node".to_string(),
                fields: vec![],
            }],
        };
        assert!(schema.kind("node").is_some());
        assert!(schema.kind("sandbox").is_none());
    }
}
