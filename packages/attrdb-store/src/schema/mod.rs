//! Attribute schemas are themselves entities, identified by the attribute id
//! they describe and decoded by well-known attribute ids.

pub mod cache;
pub mod pred;
pub mod registry;

use crate::error::{Result, StoreError, ValidationError};
use attrdb_types::entity::{DB_ID, DB_IDENT};
use attrdb_types::{Attr, Entity, Id, Value};

pub use cache::{DomainSchema, EncodedField, EncodedKind, KindSchema, SchemaCache};
pub use registry::{EntityFetcher, SchemaRegistry};

pub const DB_DOC: &str = "db/doc";
pub const DB_TYPE: &str = "db/type";
pub const DB_ELEMENT_TYPE: &str = "db/elementType";
pub const DB_CARDINALITY: &str = "db/cardinality";
pub const DB_UNIQ: &str = "db/uniq";
pub const DB_ENUM_VALUES: &str = "db/enumValues";
pub const DB_INDEX: &str = "db/index";
pub const DB_SESSION: &str = "db/session";
pub const DB_ATTR_PRED: &str = "db/attr.pred";
pub const DB_PROGRAM: &str = "db/program";
pub const DB_SCHEMA: &str = "db/schema";
pub const DB_ENSURE_ATTRS: &str = "db/ensure.attrs";

/// Value-type family an attribute schema constrains its values to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    Any,
    Bool,
    Int,
    Uint,
    Float,
    String,
    Bytes,
    Time,
    Duration,
    Ref,
    Keyword,
    Enum,
    Array,
    Component,
    Label,
}

impl SchemaType {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "any" => SchemaType::Any,
            "bool" => SchemaType::Bool,
            "int" => SchemaType::Int,
            "uint" => SchemaType::Uint,
            "float" => SchemaType::Float,
            "string" => SchemaType::String,
            "bytes" => SchemaType::Bytes,
            "time" => SchemaType::Time,
            "duration" => SchemaType::Duration,
            "ref" | "id" => SchemaType::Ref,
            "keyword" => SchemaType::Keyword,
            "enum" => SchemaType::Enum,
            "array" => SchemaType::Array,
            "component" => SchemaType::Component,
            "label" => SchemaType::Label,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            SchemaType::Any => "any",
            SchemaType::Bool => "bool",
            SchemaType::Int => "int",
            SchemaType::Uint => "uint",
            SchemaType::Float => "float",
            SchemaType::String => "string",
            SchemaType::Bytes => "bytes",
            SchemaType::Time => "time",
            SchemaType::Duration => "duration",
            SchemaType::Ref => "ref",
            SchemaType::Keyword => "keyword",
            SchemaType::Enum => "enum",
            SchemaType::Array => "array",
            SchemaType::Component => "component",
            SchemaType::Label => "label",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unique {
    #[default]
    None,
    Identity,
    Value,
}

/// Schema for a single attribute: type family, cardinality, uniqueness,
/// index/session flags, and predicates.
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub id: Id,
    pub doc: Option<String>,
    pub schema_type: SchemaType,
    pub element_type: Option<SchemaType>,
    pub enum_values: Vec<Value>,
    pub cardinality: Cardinality,
    pub unique: Unique,
    pub index: bool,
    pub session: bool,
    pub predicates: Vec<Id>,
}

impl AttributeSchema {
    pub fn new(id: impl Into<Id>, schema_type: SchemaType) -> Self {
        AttributeSchema {
            id: id.into(),
            doc: None,
            schema_type,
            element_type: None,
            enum_values: Vec::new(),
            cardinality: Cardinality::One,
            unique: Unique::None,
            index: false,
            session: false,
            predicates: Vec::new(),
        }
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn session(mut self) -> Self {
        self.session = true;
        self
    }

    pub fn unique(mut self, unique: Unique) -> Self {
        self.unique = unique;
        self
    }

    pub fn element(mut self, element: SchemaType) -> Self {
        self.element_type = Some(element);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = values;
        self
    }

    pub fn with_predicate(mut self, pred: impl Into<Id>) -> Self {
        self.predicates.push(pred.into());
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Decodes a schema from its entity form.
    pub fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .get_value(DB_IDENT)
            .and_then(value_as_id)
            .or_else(|| entity.id().cloned())
            .ok_or_else(|| invalid(DB_IDENT, "schema entity has no identity"))?;

        let type_name = entity
            .get_value(DB_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(&id, "schema entity has no db/type"))?;
        let schema_type = SchemaType::parse(type_name)
            .ok_or_else(|| invalid(&id, format!("unknown type {type_name:?}")))?;

        let element_type = match entity.get_value(DB_ELEMENT_TYPE).and_then(Value::as_str) {
            Some(name) => Some(
                SchemaType::parse(name)
                    .ok_or_else(|| invalid(&id, format!("unknown element type {name:?}")))?,
            ),
            None => None,
        };

        let cardinality = match entity.get_value(DB_CARDINALITY).and_then(Value::as_str) {
            Some("many") => Cardinality::Many,
            Some("one") | None => Cardinality::One,
            Some(other) => return Err(invalid(&id, format!("unknown cardinality {other:?}"))),
        };

        let unique = match entity.get_value(DB_UNIQ).and_then(Value::as_str) {
            Some("identity") => Unique::Identity,
            Some("value") => Unique::Value,
            Some("none") | None => Unique::None,
            Some(other) => return Err(invalid(&id, format!("unknown uniqueness {other:?}"))),
        };

        Ok(AttributeSchema {
            doc: entity
                .get_value(DB_DOC)
                .and_then(Value::as_str)
                .map(str::to_string),
            schema_type,
            element_type,
            enum_values: entity
                .get_all(DB_ENUM_VALUES)
                .into_iter()
                .map(|a| a.value.clone())
                .collect(),
            cardinality,
            unique,
            index: entity
                .get_value(DB_INDEX)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            session: entity
                .get_value(DB_SESSION)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            predicates: entity
                .get_all(DB_ATTR_PRED)
                .into_iter()
                .filter_map(|a| a.value.as_id().cloned())
                .collect(),
            id,
        })
    }

    /// Entity form of this schema, suitable for storing.
    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::new();
        entity.set_id(self.id.clone());
        entity.set(Attr::new(DB_IDENT, Value::keyword(self.id.as_str())));
        entity.set(Attr::new(DB_TYPE, Value::keyword(self.schema_type.name())));
        if let Some(doc) = &self.doc {
            entity.set(Attr::new(DB_DOC, doc.as_str()));
        }
        if let Some(element) = self.element_type {
            entity.set(Attr::new(DB_ELEMENT_TYPE, Value::keyword(element.name())));
        }
        if self.cardinality == Cardinality::Many {
            entity.set(Attr::new(DB_CARDINALITY, Value::keyword("many")));
        }
        match self.unique {
            Unique::None => {}
            Unique::Identity => {
                entity.set(Attr::new(DB_UNIQ, Value::keyword("identity")));
            }
            Unique::Value => {
                entity.set(Attr::new(DB_UNIQ, Value::keyword("value")));
            }
        }
        for value in &self.enum_values {
            entity.add(Attr::new(DB_ENUM_VALUES, value.clone()));
        }
        if self.index {
            entity.set(Attr::new(DB_INDEX, true));
        }
        if self.session {
            entity.set(Attr::new(DB_SESSION, true));
        }
        for pred in &self.predicates {
            entity.add(Attr::new(DB_ATTR_PRED, Value::Id(pred.clone())));
        }
        entity
    }
}

fn value_as_id(value: &Value) -> Option<Id> {
    match value {
        Value::Id(id) => Some(id.clone()),
        Value::Keyword(k) => Some(Id::new(k.as_str())),
        Value::String(s) => Some(Id::new(s.clone())),
        _ => None,
    }
}

fn invalid(id: impl Into<Id>, reason: impl Into<String>) -> StoreError {
    StoreError::Validation(
        ValidationError::Invalid {
            id: id.into(),
            reason: reason.into(),
        }
        .into(),
    )
}

/// Structural schemas that resolve without a KV read. They bootstrap the
/// self-describing cycle: every schema entity is itself validated against
/// these.
pub fn builtin(id: &str) -> Option<AttributeSchema> {
    use attrdb_types::entity::{
        ATTR_SESSION, DB_ENSURE, ENTITY_CREATED_AT, ENTITY_KIND, ENTITY_REVISION, ENTITY_SCHEMA,
        ENTITY_TTL, ENTITY_UPDATED_AT,
    };
    let schema = match id {
        DB_ID => AttributeSchema::new(DB_ID, SchemaType::Ref).unique(Unique::Identity),
        DB_IDENT => AttributeSchema::new(DB_IDENT, SchemaType::Keyword),
        ENTITY_REVISION => AttributeSchema::new(ENTITY_REVISION, SchemaType::Int),
        ENTITY_CREATED_AT => AttributeSchema::new(ENTITY_CREATED_AT, SchemaType::Time),
        ENTITY_UPDATED_AT => AttributeSchema::new(ENTITY_UPDATED_AT, SchemaType::Time),
        ENTITY_TTL => AttributeSchema::new(ENTITY_TTL, SchemaType::Duration),
        ENTITY_KIND => AttributeSchema::new(ENTITY_KIND, SchemaType::Ref).many().indexed(),
        ENTITY_SCHEMA => AttributeSchema::new(ENTITY_SCHEMA, SchemaType::Ref),
        ATTR_SESSION => AttributeSchema::new(ATTR_SESSION, SchemaType::Bytes).many(),
        DB_ENSURE => AttributeSchema::new(DB_ENSURE, SchemaType::Ref).many(),
        DB_ENSURE_ATTRS => AttributeSchema::new(DB_ENSURE_ATTRS, SchemaType::Keyword).many(),
        DB_DOC => AttributeSchema::new(DB_DOC, SchemaType::String),
        DB_TYPE => AttributeSchema::new(DB_TYPE, SchemaType::Keyword),
        DB_ELEMENT_TYPE => AttributeSchema::new(DB_ELEMENT_TYPE, SchemaType::Keyword),
        DB_CARDINALITY => AttributeSchema::new(DB_CARDINALITY, SchemaType::Keyword),
        DB_UNIQ => AttributeSchema::new(DB_UNIQ, SchemaType::Keyword),
        DB_ENUM_VALUES => AttributeSchema::new(DB_ENUM_VALUES, SchemaType::Any).many(),
        DB_INDEX => AttributeSchema::new(DB_INDEX, SchemaType::Bool),
        DB_SESSION => AttributeSchema::new(DB_SESSION, SchemaType::Bool),
        DB_ATTR_PRED => AttributeSchema::new(DB_ATTR_PRED, SchemaType::Ref).many(),
        DB_PROGRAM => AttributeSchema::new(DB_PROGRAM, SchemaType::String),
        DB_SCHEMA => AttributeSchema::new(DB_SCHEMA, SchemaType::Bytes),
        _ => return None,
    };
    Some(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_entity_round_trip() {
        let schema = AttributeSchema::new("sandbox/status", SchemaType::Enum)
            .with_enum(vec![Value::keyword("PENDING"), Value::keyword("READY")])
            .many()
            .indexed()
            .with_doc("lifecycle phase");
        let entity = schema.to_entity();
        let decoded = AttributeSchema::decode(&entity).unwrap();
        assert_eq!(decoded.id.as_str(), "sandbox/status");
        assert_eq!(decoded.schema_type, SchemaType::Enum);
        assert_eq!(decoded.cardinality, Cardinality::Many);
        assert!(decoded.index);
        assert!(!decoded.session);
        assert_eq!(decoded.enum_values.len(), 2);
        assert_eq!(decoded.doc.as_deref(), Some("lifecycle phase"));
    }

    #[test]
    fn decode_rejects_missing_type() {
        let mut entity = Entity::new();
        entity.set_id(Id::new("x"));
        assert!(AttributeSchema::decode(&entity).is_err());
    }

    #[test]
    fn builtins_cover_structural_attrs() {
        for id in [
            "db/id",
            "db/entity.revision",
            "db/entity.created-at",
            "entity/kind",
            "db/attr.session",
            "db/type",
            "db/attr.pred",
        ] {
            assert!(builtin(id).is_some(), "missing builtin for {id}");
        }
        assert!(builtin("custom/attr").is_none());
    }

    #[test]
    fn kind_builtin_is_indexed_many() {
        let kind = builtin("entity/kind").unwrap();
        assert!(kind.index);
        assert_eq!(kind.cardinality, Cardinality::Many);
    }
}
