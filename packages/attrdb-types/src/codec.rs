//! CBOR wire codec for entity records.
//!
//! Entities serialize as `{attrs: [...]}` only; each value is a two-element
//! tuple `[kind_code, raw]`. Tag 50 marks `Id` strings, tag 51 marks
//! `Keyword` strings, times are RFC3339Nano text. Legacy flat records and
//! the legacy `db/ident` attribute are recognized on decode and migrated;
//! writes never produce legacy forms.

use crate::attr::Attr;
use crate::entity::{Entity, DB_ID, DB_IDENT, ENTITY_CREATED_AT};
use crate::error::{DataError, Result};
use crate::id::{Id, Keyword};
use crate::value::{Value, ValueKind};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use ciborium::value::{Integer, Value as Cbor};
use std::time::Duration;

/// CBOR tag for `Id` strings.
pub const TAG_ID: u64 = 50;
/// CBOR tag for `Keyword` strings.
pub const TAG_KEYWORD: u64 = 51;

pub fn encode_entity(entity: &Entity) -> Result<Vec<u8>> {
    let cbor = entity_to_cbor(entity);
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut buf)
        .map_err(|e| DataError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_entity(bytes: &[u8]) -> Result<Entity> {
    let cbor: Cbor = ciborium::de::from_reader(bytes)
        .map_err(|e| DataError::Decode(e.to_string()))?;
    let mut entity = entity_from_cbor(&cbor)?;
    post_unmarshal(&mut entity);
    Ok(entity)
}

/// In-place migration of legacy attribute forms: `db/ident` becomes `db/id`,
/// integer `db/entity.created-at` becomes the canonical `Time` form.
pub fn post_unmarshal(entity: &mut Entity) {
    if let Some(ident) = entity.get(DB_IDENT).cloned() {
        if entity.get(DB_ID).is_none() {
            let id = match &ident.value {
                Value::Id(id) => Some(id.clone()),
                Value::String(s) => Some(Id::new(s.clone())),
                Value::Keyword(k) => Some(Id::new(k.as_str())),
                _ => None,
            };
            if let Some(id) = id {
                entity.set_id(id);
            }
        }
        entity.remove(DB_IDENT);
    }

    let legacy_created = entity.get(ENTITY_CREATED_AT).and_then(|attr| {
        if attr.value.kind() == ValueKind::Time {
            None
        } else {
            attr.value.as_i64()
        }
    });
    if let Some(nanos) = legacy_created {
        entity.set(Attr::new(ENTITY_CREATED_AT, Value::Time(nanos_to_time(nanos))));
    }
}

fn entity_to_cbor(entity: &Entity) -> Cbor {
    let attrs = entity
        .attrs()
        .iter()
        .map(|a| {
            Cbor::Array(vec![
                Cbor::Tag(TAG_ID, Box::new(Cbor::Text(a.id.as_str().to_string()))),
                value_to_cbor(&a.value),
            ])
        })
        .collect();
    Cbor::Map(vec![(Cbor::Text("attrs".to_string()), Cbor::Array(attrs))])
}

fn value_to_cbor(value: &Value) -> Cbor {
    let raw = match value {
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer(Integer::from(*i)),
        Value::Uint(u) => Cbor::Integer(Integer::from(*u)),
        Value::Float(f) => Cbor::Float(*f),
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::Time(t) => Cbor::Text(t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        Value::Duration(d) => Cbor::Integer(Integer::from(d.as_nanos() as u64)),
        Value::Id(id) => Cbor::Tag(TAG_ID, Box::new(Cbor::Text(id.as_str().to_string()))),
        Value::Keyword(k) => {
            Cbor::Tag(TAG_KEYWORD, Box::new(Cbor::Text(k.as_str().to_string())))
        }
        Value::Array(vs) => Cbor::Array(vs.iter().map(value_to_cbor).collect()),
        Value::Component(e) => entity_to_cbor(e),
        Value::Label { key, value } => {
            Cbor::Array(vec![Cbor::Text(key.clone()), Cbor::Text(value.clone())])
        }
    };
    Cbor::Array(vec![
        Cbor::Integer(Integer::from(value.kind().code())),
        raw,
    ])
}

fn entity_from_cbor(cbor: &Cbor) -> Result<Entity> {
    let Cbor::Map(entries) = cbor else {
        return Err(DataError::Decode("entity record is not a map".into()));
    };

    let mut entity = Entity::new();
    for (key, val) in entries {
        let Cbor::Text(key) = key else {
            return Err(DataError::Decode("non-text record key".into()));
        };
        match key.as_str() {
            "attrs" => {
                let Cbor::Array(items) = val else {
                    return Err(DataError::Decode("attrs is not an array".into()));
                };
                let mut attrs = Vec::with_capacity(items.len());
                for item in items {
                    attrs.push(attr_from_cbor(item)?);
                }
                entity.update(attrs);
            }
            // Legacy flat-record fields.
            "id" => {
                if let Some(text) = as_text(val) {
                    entity.set_id(Id::new(text));
                }
            }
            "revision" => {
                if let Some(rev) = as_i64(val) {
                    entity.set_revision(rev);
                }
            }
            "created_at" => {
                if let Some(t) = as_time(val)? {
                    entity.set_created_at(t);
                }
            }
            "updated_at" => {
                if let Some(t) = as_time(val)? {
                    entity.set_updated_at(t);
                }
            }
            other => {
                return Err(DataError::Decode(format!("unknown record field {other:?}")));
            }
        }
    }
    Ok(entity)
}

fn attr_from_cbor(cbor: &Cbor) -> Result<Attr> {
    let Cbor::Array(pair) = cbor else {
        return Err(DataError::Decode("attr is not a pair".into()));
    };
    if pair.len() != 2 {
        return Err(DataError::Decode("attr pair has wrong arity".into()));
    }
    let id = match &pair[0] {
        Cbor::Tag(TAG_ID, inner) => match inner.as_ref() {
            Cbor::Text(s) => Id::new(s.clone()),
            _ => return Err(DataError::Decode("attr id tag payload is not text".into())),
        },
        Cbor::Text(s) => Id::new(s.clone()),
        _ => return Err(DataError::Decode("attr id is not an id".into())),
    };
    Ok(Attr {
        id,
        value: value_from_cbor(&pair[1])?,
    })
}

fn value_from_cbor(cbor: &Cbor) -> Result<Value> {
    let Cbor::Array(pair) = cbor else {
        return Err(DataError::Decode("value is not a [kind, raw] tuple".into()));
    };
    if pair.len() != 2 {
        return Err(DataError::Decode("value tuple has wrong arity".into()));
    }
    let code = as_i64(&pair[0])
        .and_then(|c| u8::try_from(c).ok())
        .ok_or_else(|| DataError::Decode("value kind is not an integer".into()))?;
    let kind = ValueKind::from_code(code).ok_or(DataError::UnknownKind(u64::from(code)))?;
    let raw = &pair[1];

    let value = match kind {
        ValueKind::Any => {
            return Err(DataError::Decode("`any` is a schema type, not a value".into()))
        }
        ValueKind::Bool => match raw {
            Cbor::Bool(b) => Value::Bool(*b),
            _ => return Err(unexpected(kind, raw)),
        },
        ValueKind::Int => Value::Int(as_i64(raw).ok_or_else(|| unexpected(kind, raw))?),
        ValueKind::Uint => Value::Uint(as_u64(raw).ok_or_else(|| unexpected(kind, raw))?),
        ValueKind::Float => match raw {
            Cbor::Float(f) => Value::Float(*f),
            _ => return Err(unexpected(kind, raw)),
        },
        ValueKind::String => {
            Value::String(as_text(raw).ok_or_else(|| unexpected(kind, raw))?.to_string())
        }
        ValueKind::Bytes => match raw {
            Cbor::Bytes(b) => Value::Bytes(b.clone()),
            _ => return Err(unexpected(kind, raw)),
        },
        ValueKind::Time => Value::Time(
            as_time(raw)?.ok_or_else(|| unexpected(kind, raw))?,
        ),
        ValueKind::Duration => Value::Duration(Duration::from_nanos(
            as_u64(raw).ok_or_else(|| unexpected(kind, raw))?,
        )),
        ValueKind::Id => match raw {
            Cbor::Tag(TAG_ID, inner) | Cbor::Tag(TAG_KEYWORD, inner) => match inner.as_ref() {
                Cbor::Text(s) => Value::Id(Id::new(s.clone())),
                _ => return Err(unexpected(kind, raw)),
            },
            Cbor::Text(s) => Value::Id(Id::new(s.clone())),
            _ => return Err(unexpected(kind, raw)),
        },
        ValueKind::Keyword => {
            let text = match raw {
                Cbor::Tag(TAG_KEYWORD, inner) | Cbor::Tag(TAG_ID, inner) => match inner.as_ref() {
                    Cbor::Text(s) => s.as_str(),
                    _ => return Err(unexpected(kind, raw)),
                },
                Cbor::Text(s) => s.as_str(),
                _ => return Err(unexpected(kind, raw)),
            };
            Value::Keyword(Keyword::parse(text)?)
        }
        ValueKind::Array => match raw {
            Cbor::Array(items) => {
                let mut vs = Vec::with_capacity(items.len());
                for item in items {
                    vs.push(value_from_cbor(item)?);
                }
                Value::Array(vs)
            }
            _ => return Err(unexpected(kind, raw)),
        },
        ValueKind::Component => Value::component(entity_from_cbor(raw)?),
        ValueKind::Label => match raw {
            Cbor::Array(kv) if kv.len() == 2 => match (&kv[0], &kv[1]) {
                (Cbor::Text(k), Cbor::Text(v)) => Value::label(k.clone(), v.clone()),
                _ => return Err(unexpected(kind, raw)),
            },
            Cbor::Text(s) => match s.split_once('=') {
                Some((k, v)) => Value::label(k, v),
                None => return Err(unexpected(kind, raw)),
            },
            _ => return Err(unexpected(kind, raw)),
        },
    };
    Ok(value)
}

fn unexpected(kind: ValueKind, _raw: &Cbor) -> DataError {
    DataError::Decode(format!("malformed {} payload", kind.name()))
}

fn as_text(cbor: &Cbor) -> Option<&str> {
    match cbor {
        Cbor::Text(s) => Some(s),
        _ => None,
    }
}

fn as_i64(cbor: &Cbor) -> Option<i64> {
    match cbor {
        Cbor::Integer(i) => i64::try_from(*i).ok(),
        _ => None,
    }
}

fn as_u64(cbor: &Cbor) -> Option<u64> {
    match cbor {
        Cbor::Integer(i) => u64::try_from(*i).ok(),
        _ => None,
    }
}

fn as_time(cbor: &Cbor) -> Result<Option<DateTime<Utc>>> {
    match cbor {
        Cbor::Text(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| DataError::Decode(format!("bad timestamp {s:?}: {e}"))),
        Cbor::Integer(i) => Ok(i64::try_from(*i).ok().map(nanos_to_time)),
        _ => Ok(None),
    }
}

fn nanos_to_time(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
