use crate::id::Id;
use crate::value::Value;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::cmp::Ordering;
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A single typed fact about an entity: `(id, value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub id: Id,
    pub value: Value,
}

impl Attr {
    pub fn new(id: impl Into<Id>, value: impl Into<Value>) -> Self {
        Attr {
            id: id.into(),
            value: value.into(),
        }
    }

    /// Total order: id ascending, then value kind, then in-kind comparison.
    pub fn compare(&self, other: &Attr) -> Ordering {
        self.id
            .as_str()
            .cmp(other.id.as_str())
            .then_with(|| self.value.compare(&other.value))
    }

    /// Content address: base58 of BLAKE2b-256 over `id ":" kind ":" bytes`.
    /// Used as the index-collection key.
    pub fn cas(&self) -> String {
        let mut hasher = Blake2b256::new();
        self.digest_into(&mut |b| hasher.update(b));
        bs58::encode(hasher.finalize()).into_string()
    }

    /// Streams the canonical `id ":" kind ":" value_bytes` sequence.
    pub(crate) fn digest_into(&self, out: &mut dyn FnMut(&[u8])) {
        out(self.id.as_str().as_bytes());
        out(b":");
        out(self.value.kind().name().as_bytes());
        out(b":");
        self.value.digest_into(out);
    }
}

impl PartialOrd for Attr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Attr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_is_stable_across_clone() {
        let a = Attr::new("spec/image", "test:latest");
        assert_eq!(a.cas(), a.clone().cas());
    }

    #[test]
    fn cas_separates_kinds_with_equal_bytes() {
        let int = Attr::new("n", Value::Int(1));
        let uint = Attr::new("n", Value::Uint(1));
        assert_ne!(int.cas(), uint.cas());
    }

    #[test]
    fn cas_separates_ids() {
        let a = Attr::new("a", true);
        let b = Attr::new("b", true);
        assert_ne!(a.cas(), b.cas());
    }

    #[test]
    fn order_by_id_then_value() {
        let a = Attr::new("a", Value::Int(2));
        let b = Attr::new("a", Value::Int(3));
        let c = Attr::new("b", Value::Int(0));
        assert!(a < b);
        assert!(b < c);
    }
}
