//! Entity-space key layout over the external KV.
//!
//! - entity record:        `{prefix}/entity/{base58(id)}`
//! - session sidecar:      `{prefix}/entity/{base58(id)}/session/{base58(session)}`
//! - index entry:          `{prefix}/collections/{sanitized(cas)}/{base58(id)}`
//! - session index entry:  `{prefix}/collections/{sanitized(cas)}/{base58(id)}/{base58(session)}`

use attrdb_types::Id;

/// Replaces `/` and `:` so a content address is a single key segment.
pub fn sanitize(cas: &str) -> String {
    cas.replace(['/', ':'], "_")
}

pub fn b58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn b58_decode(s: &str) -> Option<Vec<u8>> {
    bs58::decode(s).into_vec().ok()
}

#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeySpace {
            prefix: prefix.into(),
        }
    }

    pub fn entity(&self, id: &Id) -> String {
        format!("{}/entity/{}", self.prefix, b58(id.as_str().as_bytes()))
    }

    pub fn sidecar_prefix(&self, id: &Id) -> String {
        format!("{}/session/", self.entity(id))
    }

    pub fn sidecar(&self, id: &Id, session: &[u8]) -> String {
        format!("{}{}", self.sidecar_prefix(id), b58(session))
    }

    pub fn index_prefix(&self, cas: &str) -> String {
        format!("{}/collections/{}/", self.prefix, sanitize(cas))
    }

    pub fn index_entry(&self, cas: &str, id: &Id) -> String {
        format!("{}{}", self.index_prefix(cas), b58(id.as_str().as_bytes()))
    }

    pub fn session_index_entry(&self, cas: &str, id: &Id, session: &[u8]) -> String {
        format!("{}/{}", self.index_entry(cas, id), b58(session))
    }

    /// Entity id from an index-entry key (plain or session-scoped).
    pub fn entity_id_from_index_key(&self, key: &str) -> Option<Id> {
        let collections = format!("{}/collections/", self.prefix);
        let rest = key.strip_prefix(collections.as_str())?;
        let mut segments = rest.split('/');
        let _cas = segments.next()?;
        let id = segments.next()?;
        decode_id(id)
    }

    /// Entity id from an entity-record or sidecar key.
    pub fn entity_id_from_entity_key(&self, key: &str) -> Option<Id> {
        let prefix = format!("{}/entity/", self.prefix);
        let rest = key.strip_prefix(prefix.as_str())?;
        let id = rest.split('/').next()?;
        decode_id(id)
    }

    /// Session bytes from a sidecar key.
    pub fn session_from_sidecar_key(&self, key: &str) -> Option<Vec<u8>> {
        let marker = "/session/";
        let at = key.rfind(marker)?;
        b58_decode(&key[at + marker.len()..])
    }
}

fn decode_id(segment: &str) -> Option<Id> {
    let bytes = b58_decode(segment)?;
    String::from_utf8(bytes).ok().map(Id::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("a/b:c"), "a_b_c");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn entity_key_round_trip() {
        let ks = KeySpace::new("miren");
        let id = Id::new("sandbox-01");
        let key = ks.entity(&id);
        assert!(key.starts_with("miren/entity/"));
        assert_eq!(ks.entity_id_from_entity_key(&key), Some(id));
    }

    #[test]
    fn sidecar_key_carries_session() {
        let ks = KeySpace::new("miren");
        let id = Id::new("e1");
        let session = vec![1u8, 2, 3];
        let key = ks.sidecar(&id, &session);
        assert_eq!(ks.entity_id_from_entity_key(&key), Some(id));
        assert_eq!(ks.session_from_sidecar_key(&key), Some(session));
    }

    #[test]
    fn index_key_round_trip() {
        let ks = KeySpace::new("miren");
        let id = Id::new("e1");
        let plain = ks.index_entry("somecas", &id);
        assert_eq!(ks.entity_id_from_index_key(&plain), Some(id.clone()));

        let scoped = ks.session_index_entry("somecas", &id, &[9u8]);
        assert!(scoped.starts_with(&plain));
        assert_eq!(ks.entity_id_from_index_key(&scoped), Some(id));
    }
}
