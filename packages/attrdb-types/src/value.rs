use crate::entity::Entity;
use crate::id::{Id, Keyword};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Kind tag for [`Value`]. The enumeration order is the canonical cross-kind
/// ordering and the codes are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Uint,
    Float,
    String,
    Bytes,
    Time,
    Duration,
    Id,
    Keyword,
    Array,
    Component,
    Label,
}

impl ValueKind {
    pub const fn code(self) -> u8 {
        match self {
            ValueKind::Any => 0,
            ValueKind::Bool => 1,
            ValueKind::Int => 2,
            ValueKind::Uint => 3,
            ValueKind::Float => 4,
            ValueKind::String => 5,
            ValueKind::Bytes => 6,
            ValueKind::Time => 7,
            ValueKind::Duration => 8,
            ValueKind::Id => 9,
            ValueKind::Keyword => 10,
            ValueKind::Array => 11,
            ValueKind::Component => 12,
            ValueKind::Label => 13,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ValueKind::Any,
            1 => ValueKind::Bool,
            2 => ValueKind::Int,
            3 => ValueKind::Uint,
            4 => ValueKind::Float,
            5 => ValueKind::String,
            6 => ValueKind::Bytes,
            7 => ValueKind::Time,
            8 => ValueKind::Duration,
            9 => ValueKind::Id,
            10 => ValueKind::Keyword,
            11 => ValueKind::Array,
            12 => ValueKind::Component,
            13 => ValueKind::Label,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Uint => "uint",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Time => "time",
            ValueKind::Duration => "duration",
            ValueKind::Id => "id",
            ValueKind::Keyword => "keyword",
            ValueKind::Array => "array",
            ValueKind::Component => "component",
            ValueKind::Label => "label",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed attribute value. Values are immutable once constructed; `clone`
/// deep-copies byte and array payloads and shares component fragments.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Duration(Duration),
    Id(Id),
    Keyword(Keyword),
    Array(Vec<Value>),
    Component(Arc<Entity>),
    Label { key: String, value: String },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Time(_) => ValueKind::Time,
            Value::Duration(_) => ValueKind::Duration,
            Value::Id(_) => ValueKind::Id,
            Value::Keyword(_) => ValueKind::Keyword,
            Value::Array(_) => ValueKind::Array,
            Value::Component(_) => ValueKind::Component,
            Value::Label { .. } => ValueKind::Label,
        }
    }

    pub fn id(s: impl Into<Id>) -> Value {
        Value::Id(s.into())
    }

    /// # Panics
    ///
    /// Panics if `s` is not a valid keyword (see [`Keyword::new`]).
    pub fn keyword(s: impl Into<String>) -> Value {
        Value::Keyword(Keyword::new(s))
    }

    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Value {
        Value::Label {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn component(entity: Entity) -> Value {
        Value::Component(Arc::new(entity))
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(values)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Keyword(k) => Some(k.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<&Id> {
        match self {
            Value::Id(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&Keyword> {
        match self {
            Value::Keyword(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(vs) => Some(vs),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&Entity> {
        match self {
            Value::Component(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<(&str, &str)> {
        match self {
            Value::Label { key, value } => Some((key, value)),
            _ => None,
        }
    }

    /// Canonical cross-kind ordering: kind code first, then the kind-specific
    /// comparison. Arrays compare by length then elementwise; components by
    /// attribute list; labels by key then value.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (a, b) = (self.kind().code(), other.kind().code());
        if a != b {
            return a.cmp(&b);
        }
        match (self, other) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Uint(x), Value::Uint(y)) => x.cmp(y),
            (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            (Value::Time(x), Value::Time(y)) => x.cmp(y),
            (Value::Duration(x), Value::Duration(y)) => x.cmp(y),
            (Value::Id(x), Value::Id(y)) => x.as_str().cmp(y.as_str()),
            (Value::Keyword(x), Value::Keyword(y)) => x.as_str().cmp(y.as_str()),
            (Value::Array(xs), Value::Array(ys)) => match xs.len().cmp(&ys.len()) {
                Ordering::Equal => {
                    for (x, y) in xs.iter().zip(ys) {
                        match x.compare(y) {
                            Ordering::Equal => continue,
                            ord => return ord,
                        }
                    }
                    Ordering::Equal
                }
                ord => ord,
            },
            (Value::Component(x), Value::Component(y)) => x.compare(y),
            (
                Value::Label { key: xk, value: xv },
                Value::Label { key: yk, value: yv },
            ) => xk.cmp(yk).then_with(|| xv.cmp(yv)),
            _ => unreachable!("kind codes matched"),
        }
    }

    /// Streams the canonical kind-tagged bytes of this value into `out`.
    ///
    /// Integers and durations are 8-byte big-endian, time is nanoseconds
    /// big-endian, bool is one byte, strings and bytes go verbatim, arrays
    /// and components recurse with `,` / `;` separators, labels as
    /// `key=value`.
    pub fn digest_into(&self, out: &mut dyn FnMut(&[u8])) {
        match self {
            Value::Bool(b) => out(&[u8::from(*b)]),
            Value::Int(i) => out(&i.to_be_bytes()),
            Value::Uint(u) => out(&u.to_be_bytes()),
            Value::Float(f) => out(&f.to_be_bytes()),
            Value::String(s) => out(s.as_bytes()),
            Value::Bytes(b) => out(b),
            Value::Time(t) => {
                let nanos = t.timestamp_nanos_opt().unwrap_or(i64::MAX);
                out(&nanos.to_be_bytes());
            }
            Value::Duration(d) => out(&(d.as_nanos() as u64).to_be_bytes()),
            Value::Id(id) => out(id.as_str().as_bytes()),
            Value::Keyword(k) => out(k.as_str().as_bytes()),
            Value::Array(vs) => {
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        out(b",");
                    }
                    v.digest_into(out);
                }
            }
            Value::Component(e) => {
                for (i, attr) in e.attrs().iter().enumerate() {
                    if i > 0 {
                        out(b";");
                    }
                    attr.digest_into(out);
                }
            }
            Value::Label { key, value } => {
                out(key.as_bytes());
                out(b"=");
                out(value.as_bytes());
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "{}", bs58::encode(b).into_string()),
            Value::Time(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Value::Duration(d) => write!(f, "{d:?}"),
            Value::Id(id) => f.write_str(id.as_str()),
            Value::Keyword(k) => f.write_str(k.as_str()),
            Value::Array(vs) => {
                f.write_str("[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Component(e) => write!(f, "component({} attrs)", e.attrs().len()),
            Value::Label { key, value } => write!(f, "{key}={value}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Uint(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<Duration> for Value {
    fn from(d: Duration) -> Self {
        Value::Duration(d)
    }
}

impl From<Id> for Value {
    fn from(id: Id) -> Self {
        Value::Id(id)
    }
}

impl From<Keyword> for Value {
    fn from(k: Keyword) -> Self {
        Value::Keyword(k)
    }
}

impl From<Entity> for Value {
    fn from(e: Entity) -> Self {
        Value::Component(Arc::new(e))
    }
}
