//! Reconcile-controller framework: a per-index watch feeds a bounded work
//! queue drained by a worker pool; periodic resync papers over missed
//! events; a ring of recent write revisions suppresses self-echo.

pub mod manager;
pub mod ring;

use async_trait::async_trait;
use attrdb_store::error::StoreError;
use attrdb_store::keys::b58_decode;
use attrdb_store::kv::{KvEventKind, KvWatch};
use attrdb_store::store::{Store, WriteOptions};
use attrdb_types::{Attr, Entity, Id};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use manager::ControllerManager;
pub use ring::RevisionRing;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("controller {0} already started")]
    AlreadyStarted(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// A unit of reconcile work derived from a KV index event or a resync pass.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub id: Id,
    pub prev_revision: Option<i64>,
    /// Populated by the worker from a fresh read; `None` for deletions and
    /// entities that vanished before the worker got to them.
    pub entity: Option<Entity>,
}

/// Attribute operation returned by raw handlers, applied as a patch against
/// the current entity.
#[derive(Debug, Clone)]
pub enum AttrOp {
    Add(Attr),
    Remove(Attr),
}

pub struct Context {
    pub controller: String,
    pub store: Arc<dyn Store>,
    /// Recent-write revisions; handlers that write through the store
    /// directly register their revisions here to suppress self-echo.
    pub ring: Arc<RevisionRing>,
}

/// Raw handler shape: receives the event, returns attribute ops the
/// framework applies with a `from_revision` precondition.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<Vec<AttrOp>>;
}

/// Batched writes from a typed reconciler, turned into one patch after the
/// handler returns.
#[derive(Debug, Default)]
pub struct Meta {
    updates: Vec<Attr>,
}

impl Meta {
    pub fn update(&mut self, attrs: impl IntoIterator<Item = Attr>) {
        self.updates.extend(attrs);
    }
}

/// Typed reconcile shape: a domain-decoded view plus a mutable [`Meta`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(
        &self,
        ctx: &Context,
        entity: &Entity,
        meta: &mut Meta,
    ) -> anyhow::Result<()>;
}

struct TypedHandler<R> {
    inner: R,
}

#[async_trait]
impl<R: Reconciler> Handler for TypedHandler<R> {
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<Vec<AttrOp>> {
        let Some(entity) = &event.entity else {
            return Ok(Vec::new());
        };
        let mut meta = Meta::default();
        self.inner.reconcile(ctx, entity, &mut meta).await?;
        Ok(meta.updates.into_iter().map(AttrOp::Add).collect())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub name: String,
    pub index_attr: Attr,
    /// Period of the synthetic full-index resync; `None` disables it.
    pub resync_period: Option<Duration>,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Capacity of the self-echo ring. Echoes are absorbed as long as the
    /// controller writes fewer revisions than this between deliveries.
    pub ring_capacity: usize,
    /// Delay before reopening a closed index watch.
    pub watch_backoff: Duration,
}

impl ControllerOptions {
    pub fn new(name: impl Into<String>, index_attr: Attr) -> Self {
        ControllerOptions {
            name: name.into(),
            index_attr,
            resync_period: None,
            workers: 1,
            queue_capacity: 1024,
            ring_capacity: 1024,
            watch_backoff: Duration::from_secs(1),
        }
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }
}

pub struct Controller {
    opts: ControllerOptions,
    store: Arc<dyn Store>,
    handler: Arc<dyn Handler>,
    ring: Arc<RevisionRing>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, handler: Arc<dyn Handler>, opts: ControllerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Controller {
            ring: Arc::new(RevisionRing::new(opts.ring_capacity)),
            opts,
            store,
            handler,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn from_reconciler<R: Reconciler>(
        store: Arc<dyn Store>,
        reconciler: R,
        opts: ControllerOptions,
    ) -> Self {
        Self::new(store, Arc::new(TypedHandler { inner: reconciler }), opts)
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn ring(&self) -> &Arc<RevisionRing> {
        &self.ring
    }

    /// Opens the index watch and spawns the event pump, worker pool, and
    /// resync timer.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReconcileError::AlreadyStarted(self.opts.name.clone()));
        }
        let _ = self.shutdown.send(false);

        let kv_watch = match self.store.watch_index(&self.opts.index_attr).await {
            Ok(w) => w,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        let (tx, rx) = mpsc::channel(self.opts.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let ctx = Arc::new(Context {
            controller: self.opts.name.clone(),
            store: self.store.clone(),
            ring: self.ring.clone(),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pump(
            self.store.clone(),
            self.opts.index_attr.clone(),
            kv_watch,
            tx.clone(),
            self.ring.clone(),
            self.shutdown.subscribe(),
            self.opts.watch_backoff,
            self.opts.name.clone(),
        )));
        for _ in 0..self.opts.workers.max(1) {
            tasks.push(tokio::spawn(worker(
                ctx.clone(),
                self.handler.clone(),
                rx.clone(),
                self.shutdown.subscribe(),
            )));
        }
        if let Some(period) = self.opts.resync_period {
            tasks.push(tokio::spawn(resync(
                self.store.clone(),
                self.opts.index_attr.clone(),
                tx,
                self.shutdown.subscribe(),
                period,
                self.opts.name.clone(),
            )));
        }
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Signals all tasks, lets workers observe the signal, and joins them.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Entity id from an index-entry key: `.../collections/{cas}/{base58(id)}`.
fn entity_id_from_index_key(key: &str) -> Option<Id> {
    let at = key.find("/collections/")?;
    let rest = &key[at + "/collections/".len()..];
    let mut segments = rest.split('/');
    let _cas = segments.next()?;
    let encoded = segments.next()?;
    let bytes = b58_decode(encoded)?;
    String::from_utf8(bytes).ok().map(Id::new)
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    store: Arc<dyn Store>,
    index_attr: Attr,
    mut kv_watch: KvWatch,
    tx: mpsc::Sender<Event>,
    ring: Arc<RevisionRing>,
    mut shutdown: watch::Receiver<bool>,
    backoff: Duration,
    controller: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = kv_watch.recv() => match maybe {
                Some(kv_event) => {
                    if ring.contains(kv_event.kv.mod_revision) {
                        debug!(controller, revision = kv_event.kv.mod_revision, "suppressing self-echo");
                        continue;
                    }
                    let Some(id) = entity_id_from_index_key(&kv_event.kv.key) else {
                        warn!(controller, key = %kv_event.kv.key, "unparseable index key");
                        continue;
                    };
                    let event_type = match kv_event.kind {
                        KvEventKind::Delete => EventType::Deleted,
                        KvEventKind::Put => {
                            if kv_event.kv.create_revision == kv_event.kv.mod_revision {
                                EventType::Created
                            } else {
                                EventType::Updated
                            }
                        }
                    };
                    let event = Event {
                        event_type,
                        id,
                        prev_revision: kv_event.prev.as_ref().map(|p| p.mod_revision),
                        entity: None,
                    };
                    // A full queue blocks the pump until space frees up or
                    // shutdown is signalled.
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                None => {
                    warn!(controller, "index watch closed; reopening");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    match store.watch_index(&index_attr).await {
                        Ok(reopened) => kv_watch = reopened,
                        Err(err) => {
                            warn!(controller, error = %err, "index watch reopen failed");
                        }
                    }
                }
            }
        }
    }
}

async fn worker(
    ctx: Arc<Context>,
    handler: Arc<dyn Handler>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = {
            let mut queue = tokio::select! {
                _ = shutdown.changed() => break,
                guard = rx.lock() => guard,
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                }
            }
        };
        process(&ctx, handler.as_ref(), event).await;
    }
}

async fn process(ctx: &Context, handler: &dyn Handler, event: Event) {
    let controller = ctx.controller.as_str();
    let mut event = event;
    let mut observed_revision = 0;
    if event.event_type != EventType::Deleted {
        match ctx.store.get(&event.id).await {
            Ok(entity) => {
                observed_revision = entity.revision();
                event.entity = Some(entity);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(controller, entity = %event.id, error = %err, "fetch failed; dropping event");
                return;
            }
        }
    }

    let ops = match handler.handle(ctx, &event).await {
        Ok(ops) => ops,
        Err(err) => {
            // No dead-letter queue: resync brings the controller back to
            // convergence.
            warn!(controller, entity = %event.id, error = %err, "handler failed; dropping event");
            return;
        }
    };
    if ops.is_empty() {
        return;
    }
    let Some(current) = event.entity else {
        return;
    };

    let mut adds = Vec::new();
    let mut removes = Vec::new();
    for op in ops {
        match op {
            AttrOp::Add(attr) => adds.push(attr),
            AttrOp::Remove(attr) => removes.push(attr),
        }
    }

    let opts = WriteOptions::new().from_revision(observed_revision);
    let written = if removes.is_empty() {
        ctx.store.update(&event.id, adds, opts).await
    } else {
        let mut next = current;
        for attr in &removes {
            next.remove_exact(attr);
        }
        next.update(adds);
        ctx.store.replace(next, opts).await
    };
    match written {
        Ok(entity) => ctx.ring.insert(entity.revision()),
        Err(err) if err.is_conflict() => {
            debug!(controller, entity = %event.id, "patch conflicted; resync will retry");
        }
        Err(err) => {
            warn!(controller, entity = %event.id, error = %err, "patch failed");
        }
    }
}

async fn resync(
    store: Arc<dyn Store>,
    index_attr: Attr,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    controller: String,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let ids = match store.list_index(&index_attr).await {
                    Ok(ids) => ids,
                    Err(err) => {
                        warn!(controller, error = %err, "resync list failed");
                        continue;
                    }
                };
                for id in ids {
                    let event = Event {
                        event_type: EventType::Updated,
                        id,
                        prev_revision: None,
                        entity: None,
                    };
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_key_parsing() {
        let cas = "abcCAS";
        let encoded = bs58_encode("s1");
        let key = format!("miren/collections/{cas}/{encoded}");
        assert_eq!(entity_id_from_index_key(&key), Some(Id::new("s1")));

        let scoped = format!("{key}/{}", bs58_encode("sess"));
        assert_eq!(entity_id_from_index_key(&scoped), Some(Id::new("s1")));

        assert_eq!(entity_id_from_index_key("nope"), None);
    }

    fn bs58_encode(s: &str) -> String {
        attrdb_store::keys::b58(s.as_bytes())
    }
}
