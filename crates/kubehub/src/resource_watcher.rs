//! Turns one resource type's list+watch feed into an ordered stream of
//! [`Delta`]s.
//!
//! The watcher owns a set of known document ids. It decides between
//! `Added` and `Updated`, replays a relist as `Sync` events followed by
//! tombstone `Deleted` events for ids that vanished while disconnected, and
//! drops deletes for ids it never delivered.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kubist_core::{CoreError, Delta, DeltaKind, ResourceObject};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw reconciliation feed for one resource type.
pub type EventStream = BoxStream<'static, Result<Event<DynamicObject>, watcher::Error>>;

/// Everything needed to start watching one resource type.
pub struct WatchTarget {
    /// Human-readable resource key, e.g. `v1/pods`.
    pub resource: String,
    /// Kind stamped on objects whose list items omit it.
    pub kind: String,
    pub events: EventStream,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("list/watch of {resource} failed: {source}")]
    Source {
        resource: String,
        #[source]
        source: watcher::Error,
    },
    #[error("{resource}: unusable object: {source}")]
    Object {
        resource: String,
        #[source]
        source: CoreError,
    },
    #[error("{resource}: serializing object: {source}")]
    Serialize {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("watcher for {0} was already started")]
    AlreadyStarted(String),
    #[error("watcher task for {resource} failed: {reason}")]
    Task { resource: String, reason: String },
}

/// Per-watcher event counts, returned when the watcher exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WatchStats {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub synced: u64,
    pub dropped_deletes: u64,
}

impl WatchStats {
    fn record(&mut self, kind: DeltaKind) {
        match kind {
            DeltaKind::Added => self.added += 1,
            DeltaKind::Updated => self.updated += 1,
            DeltaKind::Deleted => self.deleted += 1,
            DeltaKind::Sync => self.synced += 1,
        }
    }
}

pub struct ResourceWatcher {
    resource: String,
    kind: String,
    source: Option<EventStream>,
    stop: CancellationToken,
    capacity: usize,
    resync: Option<Duration>,
    task: Option<JoinHandle<Result<WatchStats, WatchError>>>,
}

impl ResourceWatcher {
    pub fn new(target: WatchTarget) -> Self {
        Self {
            resource: target.resource,
            kind: target.kind,
            source: Some(target.events),
            stop: CancellationToken::new(),
            capacity: 1024,
            resync: None,
            task: None,
        }
    }

    /// Use `stop` (typically a child of the agent's token) as this watcher's stop signal.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Bound of the output channel.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Replay every known object as `Sync` each `period`.
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Start the list/watch loop and return its output. A watcher runs once;
    /// a second call fails.
    pub fn watch(&mut self) -> Result<mpsc::Receiver<Delta>, WatchError> {
        let source = self.source.take().ok_or_else(|| WatchError::AlreadyStarted(self.resource.clone()))?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let worker = WatchLoop {
            resource: self.resource.clone(),
            kind: self.kind.clone(),
            known: KnownObjects::default(),
            tx,
            stats: WatchStats::default(),
        };
        self.task = Some(tokio::spawn(worker.run(source, self.stop.clone(), self.resync)));
        Ok(rx)
    }

    /// Ask the loop to exit at its next suspension point. The output channel
    /// closes once it has.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the loop to exit. A list/watch failure comes back as `Err`.
    pub async fn join(mut self) -> Result<WatchStats, WatchError> {
        match self.task.take() {
            None => Ok(WatchStats::default()),
            Some(handle) => handle
                .await
                .map_err(|e| WatchError::Task { resource: self.resource.clone(), reason: e.to_string() })?,
        }
    }
}

/// Document ids this watcher has delivered and not yet deleted, with the
/// last delivered snapshot of each (used for resync and tombstones).
#[derive(Default)]
struct KnownObjects {
    objects: FxHashMap<String, ResourceObject>,
}

impl KnownObjects {
    fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    fn insert(&mut self, id: String, obj: ResourceObject) {
        self.objects.insert(id, obj);
    }

    fn remove(&mut self, id: &str) -> Option<ResourceObject> {
        self.objects.remove(id)
    }

    /// Known ids not in `keep`, sorted.
    fn missing_from(&self, keep: &FxHashSet<String>) -> Vec<String> {
        let mut ids: Vec<String> = self.objects.keys().filter(|id| !keep.contains(*id)).cloned().collect();
        ids.sort_unstable();
        ids
    }

    fn snapshot(&self) -> Vec<ResourceObject> {
        let mut objs: Vec<&ResourceObject> = self.objects.values().collect();
        objs.sort_by(|a, b| a.document_id().cmp(&b.document_id()));
        objs.into_iter().cloned().collect()
    }
}

struct WatchLoop {
    resource: String,
    kind: String,
    known: KnownObjects,
    tx: mpsc::Sender<Delta>,
    stats: WatchStats,
}

/// 410 Gone on the watch. kube restarts the list itself and the next
/// `Restarted` event carries the fresh state.
fn is_expired(e: &watcher::Error) -> bool {
    matches!(e, watcher::Error::WatchError(resp) if resp.code == 410)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl WatchLoop {
    async fn run(mut self, mut source: EventStream, stop: CancellationToken, resync: Option<Duration>) -> Result<WatchStats, WatchError> {
        let mut ticker = resync.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        info!(resource = %self.resource, resync = ?resync, "watcher started");
        loop {
            let open = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!(resource = %self.resource, "watcher stopped");
                    break;
                }
                _ = tick(&mut ticker) => self.resync().await,
                next = source.next() => match next {
                    Some(Ok(event)) => self.handle(event).await?,
                    Some(Err(e)) if is_expired(&e) => {
                        warn!(resource = %self.resource, error = %e, "watch expired; waiting for relist");
                        counter!("kubist_watch_expired_total", 1);
                        true
                    }
                    Some(Err(source)) => return Err(WatchError::Source { resource: self.resource.clone(), source }),
                    None => {
                        warn!(resource = %self.resource, "watch stream ended");
                        break;
                    }
                },
            };
            if !open {
                debug!(resource = %self.resource, "delta receiver dropped; watcher exiting");
                break;
            }
        }
        Ok(self.stats)
    }

    /// Returns false once the receiving side is gone.
    async fn handle(&mut self, event: Event<DynamicObject>) -> Result<bool, WatchError> {
        match event {
            Event::Applied(o) => {
                let obj = self.convert(&o)?;
                let id = obj.document_id();
                let kind = if self.known.contains(&id) { DeltaKind::Updated } else { DeltaKind::Added };
                self.known.insert(id, obj.clone());
                Ok(self.emit(Delta::new(kind, obj)).await)
            }
            Event::Deleted(o) => {
                let obj = self.convert(&o)?;
                let id = obj.document_id();
                if self.known.remove(&id).is_none() {
                    debug!(resource = %self.resource, id = %id, "dropping delete for untracked id");
                    counter!("kubist_watch_deletes_dropped_total", 1);
                    self.stats.dropped_deletes += 1;
                    return Ok(true);
                }
                Ok(self.emit(Delta::new(DeltaKind::Deleted, obj)).await)
            }
            Event::Restarted(list) => {
                debug!(resource = %self.resource, count = list.len(), "watch restart");
                let mut listed = FxHashSet::default();
                for o in list.iter() {
                    let obj = self.convert(o)?;
                    let id = obj.document_id();
                    listed.insert(id.clone());
                    self.known.insert(id, obj.clone());
                    if !self.emit(Delta::new(DeltaKind::Sync, obj)).await {
                        return Ok(false);
                    }
                }
                // objects deleted while the watch was down
                for id in self.known.missing_from(&listed) {
                    if let Some(obj) = self.known.remove(&id) {
                        if !self.emit(Delta::new(DeltaKind::Deleted, obj)).await {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    async fn resync(&mut self) -> bool {
        let objs = self.known.snapshot();
        debug!(resource = %self.resource, count = objs.len(), "periodic resync");
        for obj in objs {
            if !self.emit(Delta::new(DeltaKind::Sync, obj)).await {
                return false;
            }
        }
        true
    }

    async fn emit(&mut self, delta: Delta) -> bool {
        counter!("kubist_watch_events_total", 1, "kind" => delta.kind.as_str());
        self.stats.record(delta.kind);
        self.tx.send(delta).await.is_ok()
    }

    fn convert(&self, o: &DynamicObject) -> Result<ResourceObject, WatchError> {
        let raw = serde_json::to_value(o)
            .map_err(|source| WatchError::Serialize { resource: self.resource.clone(), source })?;
        ResourceObject::from_json(&self.kind, raw).map_err(|source| WatchError::Object { resource: self.resource.clone(), source })
    }
}
