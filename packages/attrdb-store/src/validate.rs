//! Schema-driven validation: per-attribute type/enum/array/component/
//! predicate checks, entity-level cardinality, and `db/ensure` required
//! sets. All failures of a write aggregate into one [`ValidationErrors`].

use crate::error::{Result, StoreError, ValidationError, ValidationErrors};
use crate::schema::registry::EntityFetcher;
use crate::schema::{AttributeSchema, Cardinality, SchemaType, SchemaRegistry, DB_ENSURE_ATTRS};
use attrdb_types::entity::{DB_ENSURE, DB_ID, DB_IDENT, ENTITY_KIND, ENTITY_SCHEMA};
use attrdb_types::id::is_keyword;
use attrdb_types::{Attr, Entity, Id, Keyword, Value};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reference attributes that point back into the bootstrap cycle and are not
/// checked for target existence.
fn ref_exempt(id: &Id) -> bool {
    matches!(id.as_str(), DB_ID | ENTITY_KIND | ENTITY_SCHEMA)
}

pub struct Validator<'a> {
    registry: &'a SchemaRegistry,
    fetcher: &'a dyn EntityFetcher,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a SchemaRegistry, fetcher: &'a dyn EntityFetcher) -> Self {
        Validator { registry, fetcher }
    }

    /// Checks one attribute against its schema, predicates included.
    pub async fn validate_attribute(&self, attr: &Attr) -> Result<()> {
        let mut attr = attr.clone();
        let mut errors = ValidationErrors::new();
        self.check_attr(&mut attr, &mut errors).await?;
        errors.into_result()
    }

    /// Per-attribute checks plus the cardinality-one rule, coercing keyword
    /// and timestamp spellings in place.
    pub async fn validate_attributes(&self, attrs: Vec<Attr>) -> Result<Vec<Attr>> {
        let mut errors = ValidationErrors::new();
        let attrs = self.check_attrs(attrs, &mut errors).await?;
        errors.into_result()?;
        Ok(attrs)
    }

    /// Resolves `db/ensure` markers to required-attribute sets, strips the
    /// markers, verifies presence, then validates all attributes.
    pub async fn validate_entity(&self, entity: Entity) -> Result<Entity> {
        let mut entity = entity;
        let mut errors = ValidationErrors::new();

        let ensures: Vec<Id> = entity
            .get_all(DB_ENSURE)
            .into_iter()
            .filter_map(|a| a.value.as_id().cloned())
            .collect();
        entity.remove(DB_ENSURE);

        let mut required: Vec<Id> = Vec::new();
        for ensure_id in ensures {
            match self.fetcher.fetch(&ensure_id).await? {
                Some(ensure) => required.extend(
                    ensure
                        .get_all(DB_ENSURE_ATTRS)
                        .into_iter()
                        .filter_map(|a| a.value.as_keyword().map(|k| Id::new(k.as_str()))),
                ),
                None => errors.push(ValidationError::Invalid {
                    id: Id::new(DB_ENSURE),
                    reason: format!("ensure set {ensure_id} not found"),
                }),
            }
        }
        for req in required {
            if entity.get(req.as_str()).is_none() {
                errors.push(ValidationError::MissingRequired { id: req });
            }
        }

        let attrs = self.check_attrs(entity.into_attrs(), &mut errors).await?;
        errors.into_result()?;
        Ok(Entity::from_attrs(attrs))
    }

    async fn check_attrs(
        &self,
        mut attrs: Vec<Attr>,
        errors: &mut ValidationErrors,
    ) -> Result<Vec<Attr>> {
        let mut schemas: HashMap<Id, Arc<AttributeSchema>> = HashMap::new();
        for attr in &mut attrs {
            if let Some(schema) = self.check_attr(attr, errors).await? {
                schemas.insert(attr.id.clone(), schema);
            }
        }

        // Cardinality: at most one value per cardinality-one id.
        let mut counts: HashMap<&Id, usize> = HashMap::new();
        for attr in &attrs {
            *counts.entry(&attr.id).or_insert(0) += 1;
        }
        for (id, count) in counts {
            if count < 2 {
                continue;
            }
            if let Some(schema) = schemas.get(id) {
                if schema.cardinality == Cardinality::One {
                    errors.push(ValidationError::Cardinality { id: id.clone() });
                }
            }
        }
        Ok(attrs)
    }

    fn check_attr<'f>(
        &'f self,
        attr: &'f mut Attr,
        errors: &'f mut ValidationErrors,
    ) -> BoxFut<'f, Result<Option<Arc<AttributeSchema>>>> {
        Box::pin(async move {
            if !is_keyword(attr.id.as_str()) {
                errors.push(ValidationError::Invalid {
                    id: attr.id.clone(),
                    reason: "attribute id is not a keyword".to_string(),
                });
                return Ok(None);
            }

            let schema = match self.registry.resolve(&attr.id, self.fetcher).await {
                Ok(schema) => schema,
                Err(StoreError::SchemaNotFound(_)) | Err(StoreError::NotFound(_)) => {
                    errors.push(ValidationError::UnknownAttribute {
                        id: attr.id.clone(),
                    });
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let id = attr.id.clone();
            self.check_value(
                &id,
                schema.schema_type,
                schema.element_type,
                &schema.enum_values,
                &mut attr.value,
                errors,
            )
            .await?;

            for pred_id in &schema.predicates {
                match self.registry.predicate(pred_id, self.fetcher).await {
                    Ok(program) => {
                        match program.eval_bool(id.as_str(), id.as_str(), &attr.value) {
                            Ok(true) => {}
                            Ok(false) => errors.push(ValidationError::Predicate { id: id.clone() }),
                            Err(e) => errors.push(ValidationError::Invalid {
                                id: id.clone(),
                                reason: e.to_string(),
                            }),
                        }
                    }
                    Err(StoreError::NotFound(_)) | Err(StoreError::SchemaNotFound(_)) => {
                        errors.push(ValidationError::Invalid {
                            id: id.clone(),
                            reason: format!("predicate {pred_id} not found"),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            Ok(Some(schema))
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn check_value<'f>(
        &'f self,
        id: &'f Id,
        ty: SchemaType,
        element: Option<SchemaType>,
        enum_values: &'f [Value],
        value: &'f mut Value,
        errors: &'f mut ValidationErrors,
    ) -> BoxFut<'f, Result<()>> {
        Box::pin(async move {
            match ty {
                SchemaType::Any => {}
                SchemaType::Bool => {
                    if value.as_bool().is_none() {
                        errors.push(wrong_type(id, ty, value));
                    }
                }
                SchemaType::Int => match value {
                    Value::Int(_) => {}
                    Value::Uint(u) => match i64::try_from(*u) {
                        Ok(i) => *value = Value::Int(i),
                        Err(_) => errors.push(wrong_type(id, ty, value)),
                    },
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Uint => match value {
                    Value::Uint(_) => {}
                    Value::Int(i) => match u64::try_from(*i) {
                        Ok(u) => *value = Value::Uint(u),
                        Err(_) => errors.push(wrong_type(id, ty, value)),
                    },
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Float => {
                    if value.as_f64().is_none() {
                        errors.push(wrong_type(id, ty, value));
                    }
                }
                SchemaType::String => {
                    if !matches!(value, Value::String(_)) {
                        errors.push(wrong_type(id, ty, value));
                    }
                }
                SchemaType::Bytes => {
                    if value.as_bytes().is_none() {
                        errors.push(wrong_type(id, ty, value));
                    }
                }
                SchemaType::Time => match coerce_time(value) {
                    Some(t) => *value = Value::Time(t),
                    None => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Duration => match value {
                    Value::Duration(_) => {}
                    Value::Uint(n) => *value = Value::Duration(Duration::from_nanos(*n)),
                    Value::Int(n) if *n >= 0 => {
                        *value = Value::Duration(Duration::from_nanos(*n as u64));
                    }
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Ref => {
                    let target = match value {
                        Value::Id(target) => Some(target.clone()),
                        Value::String(s) => {
                            let target = Id::new(s.clone());
                            *value = Value::Id(target.clone());
                            Some(target)
                        }
                        _ => {
                            errors.push(wrong_type(id, ty, value));
                            None
                        }
                    };
                    if let Some(target) = target {
                        if !ref_exempt(id) && self.fetcher.fetch(&target).await?.is_none() {
                            errors.push(ValidationError::DanglingRef {
                                id: id.clone(),
                                target,
                            });
                        }
                    }
                }
                SchemaType::Keyword => match value {
                    Value::Keyword(_) => {}
                    Value::String(s) => match Keyword::parse(s) {
                        Ok(k) => *value = Value::Keyword(k),
                        Err(_) => errors.push(ValidationError::Invalid {
                            id: id.clone(),
                            reason: format!("{s:?} is not a keyword"),
                        }),
                    },
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Enum => {
                    let mut matched = enum_values.iter().any(|v| v == value);
                    if !matched {
                        // A string spelling of a keyword enum value matches
                        // after coercion.
                        let coerced = match &*value {
                            Value::String(s) => Keyword::parse(s).ok().map(Value::Keyword),
                            _ => None,
                        };
                        if let Some(candidate) = coerced {
                            if enum_values.iter().any(|v| *v == candidate) {
                                *value = candidate;
                                matched = true;
                            }
                        }
                    }
                    if !matched {
                        errors.push(ValidationError::NotInEnum {
                            id: id.clone(),
                            value: value.to_string(),
                        });
                    }
                }
                SchemaType::Array => match value {
                    Value::Array(items) => {
                        let element = element.unwrap_or(SchemaType::Any);
                        for item in items {
                            self.check_value(id, element, None, &[], item, errors).await?;
                        }
                    }
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Component => match value {
                    Value::Component(fragment) => {
                        let fragment = (**fragment).clone();
                        if fragment.get(DB_ID).is_some() || fragment.get(DB_IDENT).is_some() {
                            errors.push(ValidationError::Invalid {
                                id: id.clone(),
                                reason: "component fragment carries an identity".to_string(),
                            });
                        }
                        let mut attrs = fragment.into_attrs();
                        for attr in &mut attrs {
                            self.check_attr(attr, errors).await?;
                        }
                        *value = Value::component(Entity::from_attrs(attrs));
                    }
                    _ => errors.push(wrong_type(id, ty, value)),
                },
                SchemaType::Label => {
                    if value.as_label().is_none() {
                        errors.push(wrong_type(id, ty, value));
                    }
                }
            }
            Ok(())
        })
    }
}

fn wrong_type(id: &Id, expected: SchemaType, got: &Value) -> ValidationError {
    ValidationError::WrongType {
        id: id.clone(),
        expected: expected.name().to_string(),
        got: got.kind().name().to_string(),
    }
}

fn coerce_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Time(t) => Some(*t),
        Value::Int(n) => Some(Utc.timestamp_nanos(*n)),
        Value::Uint(n) => i64::try_from(*n).ok().map(|n| Utc.timestamp_nanos(n)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeSchema;
    use async_trait::async_trait;
    use attrdb_types::entity::DB_ID;
    use parking_lot::Mutex;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct MapFetcher {
        entities: Mutex<Map<String, Entity>>,
    }

    impl MapFetcher {
        fn with_schema(self, schema: AttributeSchema) -> Self {
            self.entities
                .lock()
                .insert(schema.id.as_str().to_string(), schema.to_entity());
            self
        }

        fn with_entity(self, entity: Entity) -> Self {
            let id = entity.id().expect("entity has id").as_str().to_string();
            self.entities.lock().insert(id, entity);
            self
        }
    }

    #[async_trait]
    impl EntityFetcher for MapFetcher {
        async fn fetch(&self, id: &Id) -> Result<Option<Entity>> {
            Ok(self.entities.lock().get(id.as_str()).cloned())
        }
    }

    #[tokio::test]
    async fn coerces_keyword_from_string() {
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("node/status", SchemaType::Keyword));
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let attrs = validator
            .validate_attributes(vec![Attr::new("node/status", "READY")])
            .await
            .unwrap();
        assert_eq!(attrs[0].value, Value::keyword("READY"));

        let err = validator
            .validate_attributes(vec![Attr::new("node/status", "not a keyword")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn coerces_timestamps_from_int_and_string() {
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("job/at", SchemaType::Time));
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let attrs = validator
            .validate_attributes(vec![Attr::new("job/at", Value::Int(1_000_000_000))])
            .await
            .unwrap();
        assert_eq!(
            attrs[0].value.as_time().unwrap(),
            Utc.timestamp_nanos(1_000_000_000)
        );

        let attrs = validator
            .validate_attributes(vec![Attr::new("job/at", "2024-05-01T10:00:00Z")])
            .await
            .unwrap();
        assert!(attrs[0].value.as_time().is_some());
    }

    #[tokio::test]
    async fn rejects_wrong_types() {
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("node/port", SchemaType::Int));
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let err = validator
            .validate_attribute(&Attr::new("node/port", "eighty"))
            .await
            .unwrap_err();
        let StoreError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(matches!(
            errors.errors()[0],
            ValidationError::WrongType { .. }
        ));
    }

    #[tokio::test]
    async fn cardinality_one_rejects_two_values() {
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("node/name", SchemaType::String));
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let err = validator
            .validate_attributes(vec![
                Attr::new("node/name", "a"),
                Attr::new("node/name", "b"),
            ])
            .await
            .unwrap_err();
        let StoreError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(errors
            .errors()
            .iter()
            .any(|e| matches!(e, ValidationError::Cardinality { .. })));
    }

    #[tokio::test]
    async fn array_elements_validate_against_element_type() {
        let fetcher = MapFetcher::default().with_schema(
            AttributeSchema::new("node/ports", SchemaType::Array).element(SchemaType::Int),
        );
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        validator
            .validate_attribute(&Attr::new(
                "node/ports",
                Value::Array(vec![Value::Int(80), Value::Int(443)]),
            ))
            .await
            .unwrap();

        let err = validator
            .validate_attribute(&Attr::new(
                "node/ports",
                Value::Array(vec![Value::Int(80), Value::from("http")]),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn component_fragments_must_not_carry_identity() {
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("sched/key", SchemaType::Component));
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let mut fragment = Entity::new();
        fragment.set_id(Id::new("nested"));
        let err = validator
            .validate_attribute(&Attr::new("sched/key", Value::component(fragment)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn ensure_markers_resolve_and_strip() {
        let ensure_set = {
            let mut e = Entity::new().with(DB_ENSURE_ATTRS, Value::keyword("node/status"));
            e.set_id(Id::new("ensure/node"));
            e
        };
        let fetcher = MapFetcher::default()
            .with_schema(AttributeSchema::new("node/status", SchemaType::Keyword))
            .with_entity(ensure_set);
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let missing = Entity::new().with(DB_ENSURE, Value::id("ensure/node"));
        let err = validator.validate_entity(missing).await.unwrap_err();
        let StoreError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(errors
            .errors()
            .iter()
            .any(|e| matches!(e, ValidationError::MissingRequired { .. })));

        let ok = Entity::new()
            .with(DB_ENSURE, Value::id("ensure/node"))
            .with("node/status", Value::keyword("READY"));
        let validated = validator.validate_entity(ok).await.unwrap();
        assert!(validated.get(DB_ENSURE).is_none());
        assert!(validated.get("node/status").is_some());
    }

    #[tokio::test]
    async fn unknown_attribute_is_reported_by_id() {
        let fetcher = MapFetcher::default();
        let registry = SchemaRegistry::new(128);
        let validator = Validator::new(&registry, &fetcher);

        let err = validator
            .validate_attribute(&Attr::new("ghost/attr", 1i64))
            .await
            .unwrap_err();
        let StoreError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert_eq!(
            errors.errors()[0],
            ValidationError::UnknownAttribute {
                id: Id::new("ghost/attr")
            }
        );
    }

    #[test]
    fn ref_exemptions_cover_bootstrap_attrs() {
        assert!(ref_exempt(&Id::new(DB_ID)));
        assert!(ref_exempt(&Id::new(ENTITY_KIND)));
        assert!(!ref_exempt(&Id::new("sandbox/node")));
    }
}
