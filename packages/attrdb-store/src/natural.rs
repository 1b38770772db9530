//! Natural codec: encode/decode entities to and from human-authored
//! structured documents (`{kind, version, spec}`), driven by an encoded kind
//! schema. YAML and JSON are both supported.

use crate::error::{Result, StoreError, ValidationError, ValidationErrors};
use crate::schema::cache::{EncodedField, KindSchema};
use attrdb_types::entity::ENTITY_KIND;
use attrdb_types::{Attr, Entity, Id, Keyword, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as Json};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub kind: String,
    pub version: String,
    pub spec: Json,
}

pub fn document_from_yaml(input: &str) -> Result<Document> {
    serde_yaml::from_str(input).map_err(|e| StoreError::Transport(format!("bad document: {e}")))
}

pub fn document_from_json(input: &str) -> Result<Document> {
    serde_json::from_str(input).map_err(|e| StoreError::Transport(format!("bad document: {e}")))
}

pub fn document_to_yaml(doc: &Document) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| StoreError::Transport(format!("document encode: {e}")))
}

pub fn document_to_json(doc: &Document) -> Result<String> {
    serde_json::to_string_pretty(doc)
        .map_err(|e| StoreError::Transport(format!("document encode: {e}")))
}

/// Decodes a document spec into attributes. The outermost level appends the
/// kind reference `{domain}/kind.{kind}`.
pub fn decode(doc: &Document, schema: &KindSchema) -> Result<Vec<Attr>> {
    let mut errors = ValidationErrors::new();
    let mut attrs = Vec::new();
    decode_spec(&doc.spec, &schema.fields, &mut attrs, &mut errors);
    errors.into_result()?;
    attrs.push(Attr::new(ENTITY_KIND, Value::Id(schema.kind_id())));
    Ok(attrs)
}

fn decode_spec(
    spec: &Json,
    fields: &[EncodedField],
    out: &mut Vec<Attr>,
    errors: &mut ValidationErrors,
) {
    match spec {
        Json::Null => {}
        Json::Object(map) => decode_map(map, fields, out, errors),
        // List form: a sequence of {field: value} maps.
        Json::Array(items) => {
            for item in items {
                match item {
                    Json::Object(map) => decode_map(map, fields, out, errors),
                    other => errors.push(ValidationError::Invalid {
                        id: Id::new("spec"),
                        reason: format!("expected a map entry, got {other}"),
                    }),
                }
            }
        }
        other => errors.push(ValidationError::Invalid {
            id: Id::new("spec"),
            reason: format!("expected a map or list, got {other}"),
        }),
    }
}

fn decode_map(
    map: &JsonMap<String, Json>,
    fields: &[EncodedField],
    out: &mut Vec<Attr>,
    errors: &mut ValidationErrors,
) {
    for (name, value) in map {
        let Some(field) = fields.iter().find(|f| f.name == *name) else {
            errors.push(ValidationError::UnknownAttribute {
                id: Id::new(name.clone()),
            });
            continue;
        };
        if value.is_null() {
            continue;
        }
        // `many` accepts either a single value or an array.
        let items: Vec<&Json> = match value {
            Json::Array(items) if field.many => items.iter().collect(),
            single => vec![single],
        };
        for item in items {
            match decode_value(field, item) {
                Ok(v) => out.push(Attr::new(field.id.as_str(), v)),
                Err(e) => errors.push(e),
            }
        }
    }
}

fn decode_value(field: &EncodedField, json: &Json) -> std::result::Result<Value, ValidationError> {
    let id = || Id::new(field.id.as_str());
    let bad = |reason: String| ValidationError::Invalid { id: id(), reason };

    match field.field_type.as_str() {
        "bool" => json.as_bool().map(Value::Bool).ok_or_else(|| bad(format!("expected bool, got {json}"))),
        "int" => json.as_i64().map(Value::Int).ok_or_else(|| bad(format!("expected int, got {json}"))),
        "uint" => json.as_u64().map(Value::Uint).ok_or_else(|| bad(format!("expected uint, got {json}"))),
        "float" => json.as_f64().map(Value::Float).ok_or_else(|| bad(format!("expected float, got {json}"))),
        "string" => json
            .as_str()
            .map(Value::from)
            .ok_or_else(|| bad(format!("expected string, got {json}"))),
        "time" => {
            let s = json.as_str().ok_or_else(|| bad("expected RFC3339 timestamp".into()))?;
            DateTime::parse_from_rfc3339(s)
                .map(|t| Value::Time(t.with_timezone(&Utc)))
                .map_err(|e| bad(format!("bad timestamp {s:?}: {e}")))
        }
        "duration" => {
            let s = json.as_str().ok_or_else(|| bad("expected duration string".into()))?;
            parse_duration(s).map(Value::Duration).ok_or_else(|| bad(format!("bad duration {s:?}")))
        }
        "bytes" => {
            let s = json.as_str().ok_or_else(|| bad("expected base64 string".into()))?;
            BASE64
                .decode(s)
                .map(Value::Bytes)
                .map_err(|e| bad(format!("bad base64: {e}")))
        }
        "ref" | "id" => json
            .as_str()
            .map(|s| Value::Id(Id::new(s)))
            .ok_or_else(|| bad(format!("expected id, got {json}"))),
        "keyword" => {
            let s = json.as_str().ok_or_else(|| bad("expected keyword".into()))?;
            Keyword::parse(s)
                .map(Value::Keyword)
                .map_err(|_| bad(format!("{s:?} is not a keyword")))
        }
        "label" => match json {
            Json::String(s) => match s.split_once('=') {
                Some((k, v)) => Ok(Value::label(k, v)),
                None => Err(bad(format!("label {s:?} is not k=v"))),
            },
            Json::Object(map) if map.len() == 1 => {
                let (k, v) = map.iter().next().ok_or_else(|| bad("empty label".into()))?;
                let v = v.as_str().ok_or_else(|| bad("label value is not a string".into()))?;
                Ok(Value::label(k.clone(), v))
            }
            other => Err(bad(format!("expected label, got {other}"))),
        },
        "enum" => {
            let s = json.as_str().ok_or_else(|| bad("expected enum name".into()))?;
            if !field.enum_values.iter().any(|v| v == s) {
                return Err(ValidationError::NotInEnum {
                    id: id(),
                    value: s.to_string(),
                });
            }
            Ok(match Keyword::parse(s) {
                Ok(k) => Value::Keyword(k),
                Err(_) => Value::from(s),
            })
        }
        "component" => {
            let fields = field
                .component
                .as_deref()
                .ok_or_else(|| bad("component field has no schema".into()))?;
            let mut attrs = Vec::new();
            let mut errors = ValidationErrors::new();
            decode_spec(json, fields, &mut attrs, &mut errors);
            if !errors.is_empty() {
                return Err(bad(errors.to_string()));
            }
            Ok(Value::component(Entity::from_attrs(attrs)))
        }
        other => Err(bad(format!("unknown field type {other:?}"))),
    }
}

/// Encodes an entity back into the document shape, grouping by field id and
/// respecting `many`.
pub fn encode(entity: &Entity, schema: &KindSchema) -> Result<Document> {
    let spec = encode_fields(entity.attrs(), &schema.fields)?;
    Ok(Document {
        kind: schema.document_kind(),
        version: schema.version.clone(),
        spec,
    })
}

fn encode_fields(attrs: &[Attr], fields: &[EncodedField]) -> Result<Json> {
    let mut map = JsonMap::new();
    for field in fields {
        let matching: Vec<&Attr> = attrs
            .iter()
            .filter(|a| a.id.as_str() == field.id)
            .collect();
        if matching.is_empty() {
            continue;
        }
        if field.many {
            let mut items = Vec::with_capacity(matching.len());
            for attr in &matching {
                items.push(encode_value(field, &attr.value)?);
            }
            map.insert(field.name.clone(), Json::Array(items));
        } else {
            map.insert(field.name.clone(), encode_value(field, &matching[0].value)?);
        }
    }
    Ok(Json::Object(map))
}

fn encode_value(field: &EncodedField, value: &Value) -> Result<Json> {
    let out = match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Uint(u) => Json::from(*u),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(BASE64.encode(b)),
        Value::Time(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        Value::Duration(d) => Json::String(format_duration(*d)),
        Value::Id(id) => Json::String(id.as_str().to_string()),
        Value::Keyword(k) => Json::String(k.as_str().to_string()),
        Value::Label { key, value } => Json::String(format!("{key}={value}")),
        Value::Component(fragment) => {
            let fields = field.component.as_deref().unwrap_or(&[]);
            encode_fields(fragment.attrs(), fields)?
        }
        Value::Array(_) => {
            return Err(StoreError::Validation(
                ValidationError::Invalid {
                    id: Id::new(field.id.as_str()),
                    reason: "array values are expressed as many fields".to_string(),
                }
                .into(),
            ))
        }
    };
    Ok(out)
}

/// Parses a suffixed duration string: `10s`, `250ms`, `2m`, `1h`, `500us`,
/// `30ns`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let (number, suffix) = s.split_at(digits_end);
    let n: u64 = number.parse().ok()?;
    match suffix {
        "ns" => Some(Duration::from_nanos(n)),
        "us" => Some(Duration::from_micros(n)),
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos % 1_000_000_000 == 0 {
        format!("{}s", d.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{nanos}ns")
    }
}
