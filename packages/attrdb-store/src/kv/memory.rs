//! Deterministic in-memory implementation of the [`Kv`] contract, used by
//! tests and embedded deployments.

use super::{
    Compare, Kv, KvEvent, KvEventKind, KvWatch, KeyValue, LeaseId, LeaseInfo, TxnOp, TxnResponse,
    TxnResult,
};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: LeaseId,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    key: String,
    prefix: bool,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<KvEvent>,
}

#[derive(Default)]
struct State {
    keys: BTreeMap<String, Record>,
    revision: i64,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
}

/// In-memory linearizable KV with revisions, prefix watches, and leases.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            state: Mutex::new(State {
                next_lease: 1,
                ..State::default()
            }),
        }
    }

    /// Revokes every lease whose TTL has elapsed. Called on entry to each
    /// public operation so expiry does not need a background task.
    fn expire_due(state: &mut State) {
        let now = Instant::now();
        let due: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in due {
            Self::revoke_locked(state, lease);
        }
    }

    fn revoke_locked(state: &mut State, lease: LeaseId) {
        let Some(entry) = state.leases.remove(&lease) else {
            return;
        };
        if entry.keys.is_empty() {
            return;
        }
        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::new();
        let mut keys: Vec<String> = entry.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            if let Some(prev) = state.keys.remove(&key) {
                events.push(KvEvent {
                    kind: KvEventKind::Delete,
                    kv: KeyValue {
                        key: key.clone(),
                        value: Vec::new(),
                        create_revision: 0,
                        mod_revision: revision,
                        lease: 0,
                    },
                    prev: Some(record_kv(&key, &prev)),
                });
            }
        }
        Self::dispatch(state, events);
    }

    fn dispatch(state: &mut State, events: Vec<KvEvent>) {
        if events.is_empty() {
            return;
        }
        state.watchers.retain(|w| {
            for event in &events {
                let matches = if w.prefix {
                    event.kv.key.starts_with(&w.key)
                } else {
                    event.kv.key == w.key
                };
                if !matches {
                    continue;
                }
                let mut event = event.clone();
                if !w.prev_kv {
                    event.prev = None;
                }
                if w.tx.send(event).is_err() {
                    return false;
                }
            }
            true
        });
    }

    fn apply(state: &mut State, op: &TxnOp, revision: i64, events: &mut Vec<KvEvent>) -> Result<TxnResult> {
        match op {
            TxnOp::Put { key, value, lease } => {
                if *lease != 0 && !state.leases.contains_key(lease) {
                    return Err(StoreError::Transport(format!("lease {lease} not found")));
                }
                let prev = state.keys.get(key).cloned();
                if let Some(prev) = &prev {
                    if prev.lease != 0 && prev.lease != *lease {
                        if let Some(old) = state.leases.get_mut(&prev.lease) {
                            old.keys.remove(key);
                        }
                    }
                }
                let record = Record {
                    value: value.clone(),
                    create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
                    mod_revision: revision,
                    lease: *lease,
                };
                if *lease != 0 {
                    if let Some(entry) = state.leases.get_mut(lease) {
                        entry.keys.insert(key.clone());
                    }
                }
                events.push(KvEvent {
                    kind: KvEventKind::Put,
                    kv: record_kv(key, &record),
                    prev: prev.as_ref().map(|p| record_kv(key, p)),
                });
                state.keys.insert(key.clone(), record);
                Ok(TxnResult::Done)
            }
            TxnOp::Delete { key } => {
                let deleted = Self::delete_key(state, key, revision, events);
                Ok(TxnResult::Deleted(u64::from(deleted)))
            }
            TxnOp::DeletePrefix { prefix } => {
                let keys: Vec<String> = Self::scan(state, prefix).map(|(k, _)| k.clone()).collect();
                let mut count = 0u64;
                for key in keys {
                    if Self::delete_key(state, &key, revision, events) {
                        count += 1;
                    }
                }
                Ok(TxnResult::Deleted(count))
            }
            TxnOp::Get { key } => {
                let kvs = state
                    .keys
                    .get(key)
                    .map(|r| vec![record_kv(key, r)])
                    .unwrap_or_default();
                Ok(TxnResult::Range(kvs))
            }
            TxnOp::GetPrefix { prefix } => {
                let kvs = Self::scan(state, prefix)
                    .map(|(k, r)| record_kv(k, r))
                    .collect();
                Ok(TxnResult::Range(kvs))
            }
        }
    }

    fn delete_key(state: &mut State, key: &str, revision: i64, events: &mut Vec<KvEvent>) -> bool {
        let Some(prev) = state.keys.remove(key) else {
            return false;
        };
        if prev.lease != 0 {
            if let Some(entry) = state.leases.get_mut(&prev.lease) {
                entry.keys.remove(key);
            }
        }
        events.push(KvEvent {
            kind: KvEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: revision,
                lease: 0,
            },
            prev: Some(record_kv(key, &prev)),
        });
        true
    }

    fn scan<'a>(
        state: &'a State,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Record)> {
        state
            .keys
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    fn check(state: &State, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => {
                let current = state.keys.get(key).map_or(0, |r| r.create_revision);
                current == *revision
            }
            Compare::ModRevision { key, revision } => {
                let current = state.keys.get(key).map_or(0, |r| r.mod_revision);
                current == *revision
            }
        }
    }
}

fn record_kv(key: &str, record: &Record) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: record.value.clone(),
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        lease: record.lease,
    }
}

fn is_mutation(op: &TxnOp) -> bool {
    matches!(
        op,
        TxnOp::Put { .. } | TxnOp::Delete { .. } | TxnOp::DeletePrefix { .. }
    )
}

#[async_trait]
impl Kv for MemoryKv {
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResponse> {
        let mut state = self.state.lock();
        Self::expire_due(&mut state);

        let succeeded = compares.iter().all(|c| Self::check(&state, c));
        let branch = if succeeded { &success } else { &failure };

        let revision = if branch.iter().any(is_mutation) {
            state.revision += 1;
            state.revision
        } else {
            state.revision
        };

        let mut events = Vec::new();
        let mut results = Vec::with_capacity(branch.len());
        for op in branch {
            results.push(Self::apply(&mut state, op, revision, &mut events)?);
        }
        Self::dispatch(&mut state, events);

        Ok(TxnResponse {
            succeeded,
            revision,
            results,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut state = self.state.lock();
        Self::expire_due(&mut state);
        Ok(state.keys.get(key).map(|r| record_kv(key, r)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut state = self.state.lock();
        Self::expire_due(&mut state);
        Ok(Self::scan(&state, prefix)
            .map(|(k, r)| record_kv(k, r))
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut state = self.state.lock();
        Self::expire_due(&mut state);
        let keys: Vec<String> = Self::scan(&state, prefix).map(|(k, _)| k.clone()).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::new();
        let mut count = 0u64;
        for key in keys {
            if Self::delete_key(&mut state, &key, revision, &mut events) {
                count += 1;
            }
        }
        Self::dispatch(&mut state, events);
        Ok(count)
    }

    async fn watch(&self, key: &str, prefix: bool, prev_kv: bool) -> Result<KvWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.watchers.push(Watcher {
            key: key.to_string(),
            prefix,
            prev_kv,
            tx,
        });
        Ok(KvWatch::new(rx))
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock();
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        Self::revoke_locked(&mut state, lease);
        Ok(())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.leases.get_mut(&lease) else {
            return Err(StoreError::Transport(format!("lease {lease} not found")));
        };
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn lease_info(&self, lease: LeaseId) -> Result<LeaseInfo> {
        let state = self.state.lock();
        let Some(entry) = state.leases.get(&lease) else {
            return Err(StoreError::Transport(format!("lease {lease} not found")));
        };
        let mut keys: Vec<String> = entry.keys.iter().cloned().collect();
        keys.sort();
        Ok(LeaseInfo {
            id: lease,
            remaining: entry.expires_at.saturating_duration_since(Instant::now()),
            keys,
        })
    }
}
