//! The external linearizable key-value contract the store is layered on:
//! compare-and-set transactions over create/mod revisions, prefix range
//! reads and deletes, prefix watches with previous-value delivery, and
//! leases with TTL, keep-alive, revoke, and attached-key enumeration.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::MemoryKv;

/// Lease identifier; 0 means "no lease".
pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: LeaseId,
}

/// Transaction guard over a key's revision bookkeeping. A create revision of
/// 0 asserts the key does not exist.
#[derive(Debug, Clone)]
pub enum Compare {
    CreateRevision { key: String, revision: i64 },
    ModRevision { key: String, revision: i64 },
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
    },
    Delete {
        key: String,
    },
    DeletePrefix {
        prefix: String,
    },
    Get {
        key: String,
    },
    GetPrefix {
        prefix: String,
    },
}

#[derive(Debug, Clone)]
pub enum TxnResult {
    Done,
    Deleted(u64),
    Range(Vec<KeyValue>),
}

impl TxnResult {
    pub fn range(&self) -> &[KeyValue] {
        match self {
            TxnResult::Range(kvs) => kvs,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Revision assigned to the transaction's mutations (unchanged when the
    /// branch taken was read-only).
    pub revision: i64,
    pub results: Vec<TxnResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub kv: KeyValue,
    pub prev: Option<KeyValue>,
}

/// A live watch stream. Dropping it cancels the subscription.
pub struct KvWatch {
    rx: mpsc::UnboundedReceiver<KvEvent>,
}

impl std::fmt::Debug for KvWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvWatch").finish_non_exhaustive()
    }
}

impl KvWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<KvEvent>) -> Self {
        KvWatch { rx }
    }

    /// Next event, or `None` once the watch is closed.
    pub async fn recv(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub remaining: Duration,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait Kv: Send + Sync + 'static {
    /// Atomically evaluates `compares`; applies `success` when they all hold,
    /// `failure` otherwise. All mutations in the taken branch share one
    /// revision.
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResponse>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Subscribes to changes on `key` (or the `key` prefix). Events carry the
    /// previous value when `prev_kv` is set.
    async fn watch(&self, key: &str, prefix: bool, prev_kv: bool) -> Result<KvWatch>;

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Revokes the lease and deletes every key attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn lease_info(&self, lease: LeaseId) -> Result<LeaseInfo>;
}
