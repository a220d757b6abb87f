#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kubist_apply::{ApplyError, ApplyOutcome, Applier, Conflict};
use kubist_core::{Delta, DeltaKind, ResourceObject};
use kubist_store::{Body, Document, DocumentStore, MemoryStore, StoreError, StoreResult, WriteResult};
use serde_json::json;

fn web1(rv: &str) -> ResourceObject {
    ResourceObject::from_json(
        "Pod",
        json!({
            "kind": "Pod",
            "metadata": {"name": "web-1", "namespace": "default", "resourceVersion": rv},
            "status": {"phase": "Running"}
        }),
    )
    .unwrap()
}

fn delta(kind: DeltaKind, rv: &str) -> Delta {
    Delta::new(kind, web1(rv))
}

const ID: &str = "Pod/default/web-1";

fn stored_rv(store: &MemoryStore) -> Option<String> {
    store.snapshot(ID).and_then(|d| d.resource_version().map(str::to_string))
}

#[tokio::test]
async fn added_creates_then_duplicate_add_conflicts() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let first = applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();
    assert!(matches!(first, ApplyOutcome::Created { .. }));
    let doc = store.snapshot(ID).unwrap();
    assert_eq!(doc.body["_id"], json!(ID));
    assert_eq!(stored_rv(&store).as_deref(), Some("10"));

    let second = applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();
    assert_eq!(second, ApplyOutcome::Conflict(Conflict::AlreadyExists { version: "10".into() }));
    assert_eq!(store.snapshot(ID).unwrap().rev, doc.rev);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn added_never_overwrites_a_different_version() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());
    applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();

    let out = applier.apply(&delta(DeltaKind::Added, "15")).await.unwrap();
    assert_eq!(out, ApplyOutcome::Conflict(Conflict::VersionMismatch { stored: "10".into(), incoming: "15".into() }));
    assert_eq!(stored_rv(&store).as_deref(), Some("10"));
}

#[tokio::test]
async fn updates_follow_numeric_version_order() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());
    applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();

    let up = applier.apply(&delta(DeltaKind::Updated, "12")).await.unwrap();
    assert!(matches!(up, ApplyOutcome::Updated { ref rev } if rev.starts_with("2-")));
    assert_eq!(stored_rv(&store).as_deref(), Some("12"));

    let stale = applier.apply(&delta(DeltaKind::Updated, "11")).await.unwrap();
    assert_eq!(stale, ApplyOutcome::Conflict(Conflict::Stale { stored: "12".into(), incoming: "11".into() }));
    assert_eq!(stored_rv(&store).as_deref(), Some("12"));

    // "9" < "10" numerically even though it sorts after it as text
    let older = applier.apply(&delta(DeltaKind::Sync, "9")).await.unwrap();
    assert!(matches!(older, ApplyOutcome::Conflict(Conflict::Stale { .. })));
}

#[tokio::test]
async fn update_and_sync_are_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let first = applier.apply(&delta(DeltaKind::Updated, "20")).await.unwrap();
    assert!(first.is_write());
    let rev = store.snapshot(ID).unwrap().rev;
    for kind in [DeltaKind::Updated, DeltaKind::Sync, DeltaKind::Sync] {
        assert_eq!(applier.apply(&delta(kind, "20")).await.unwrap(), ApplyOutcome::Unchanged);
    }
    assert_eq!(store.snapshot(ID).unwrap().rev, rev);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn sync_for_unknown_id_creates() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());
    let out = applier.apply(&delta(DeltaKind::Sync, "3")).await.unwrap();
    assert!(matches!(out, ApplyOutcome::Created { .. }));
}

#[tokio::test]
async fn delete_removes_and_repeats_are_noops() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());
    assert_eq!(applier.apply(&delta(DeltaKind::Deleted, "1")).await.unwrap(), ApplyOutcome::Absent);

    applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();
    assert_eq!(applier.apply(&delta(DeltaKind::Deleted, "13")).await.unwrap(), ApplyOutcome::Deleted);
    assert!(store.snapshot(ID).is_none());
    assert_eq!(applier.apply(&delta(DeltaKind::Deleted, "13")).await.unwrap(), ApplyOutcome::Absent);
}

#[tokio::test]
async fn malformed_version_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());
    applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();

    let err = applier.apply(&delta(DeltaKind::Updated, "abc")).await.unwrap_err();
    assert!(matches!(err, ApplyError::Version { ref id, .. } if id == ID), "err={}", err);
}

/// Store whose next write loses a race to another writer.
struct RacingStore {
    inner: MemoryStore,
    race: AtomicBool,
}

#[async_trait::async_trait]
impl DocumentStore for RacingStore {
    async fn exists(&self) -> StoreResult<bool> {
        self.inner.exists().await
    }

    async fn create(&self) -> StoreResult<()> {
        self.inner.create().await
    }

    async fn drop_database(&self) -> StoreResult<()> {
        self.inner.drop_database().await
    }

    async fn get_or_none(&self, id: &str) -> StoreResult<Option<Document>> {
        self.inner.get_or_none(id).await
    }

    async fn put(&self, id: &str, body: Body, rev: Option<&str>) -> StoreResult<WriteResult> {
        self.write_first(id).await?;
        self.inner.put(id, body, rev).await
    }

    async fn delete(&self, doc: &Document) -> StoreResult<WriteResult> {
        self.write_first(&doc.id).await?;
        self.inner.delete(doc).await
    }
}

impl RacingStore {
    /// Another writer lands between our read and our write, once.
    async fn write_first(&self, id: &str) -> StoreResult<()> {
        if self.race.swap(false, Ordering::SeqCst) {
            let mut theirs = Body::new();
            theirs.insert("metadata".into(), json!({"resourceVersion": "99"}));
            let cur = self.inner.get_or_none(id).await?;
            self.inner.put(id, theirs, cur.as_ref().map(|d| d.rev.as_str())).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn store_conflict_on_write_is_reported_not_retried() {
    let store = Arc::new(RacingStore { inner: MemoryStore::new(), race: AtomicBool::new(true) });
    let applier = Applier::new(store.clone());

    let out = applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap();
    assert!(matches!(out, ApplyOutcome::Conflict(Conflict::Rejected { code: 409, .. })), "out={:?}", out);
    let doc = store.inner.snapshot(ID).unwrap();
    assert_eq!(doc.resource_version(), Some("99"));
}

#[tokio::test]
async fn store_conflict_on_delete_is_reported_and_keeps_the_document() {
    let store = Arc::new(RacingStore { inner: MemoryStore::new(), race: AtomicBool::new(false) });
    let applier = Applier::new(store.clone());
    assert!(matches!(applier.apply(&delta(DeltaKind::Added, "10")).await.unwrap(), ApplyOutcome::Created { .. }));

    store.race.store(true, Ordering::SeqCst);
    let out = applier.apply(&delta(DeltaKind::Deleted, "11")).await.unwrap();
    assert!(matches!(out, ApplyOutcome::Conflict(Conflict::Rejected { code: 409, .. })), "out={:?}", out);
    assert_eq!(store.inner.snapshot(ID).unwrap().resource_version(), Some("99"));
}

/// Store that fails every call below the status layer.
struct BrokenStore;

#[async_trait::async_trait]
impl DocumentStore for BrokenStore {
    async fn exists(&self) -> StoreResult<bool> {
        Err(StoreError::BaseUrl("broken".into()))
    }

    async fn create(&self) -> StoreResult<()> {
        Err(StoreError::BaseUrl("broken".into()))
    }

    async fn drop_database(&self) -> StoreResult<()> {
        Err(StoreError::BaseUrl("broken".into()))
    }

    async fn get_or_none(&self, _id: &str) -> StoreResult<Option<Document>> {
        Err(StoreError::BaseUrl("broken".into()))
    }

    async fn put(&self, _id: &str, _body: Body, _rev: Option<&str>) -> StoreResult<WriteResult> {
        Err(StoreError::BaseUrl("broken".into()))
    }

    async fn delete(&self, _doc: &Document) -> StoreResult<WriteResult> {
        Err(StoreError::BaseUrl("broken".into()))
    }
}

#[tokio::test]
async fn non_status_store_errors_propagate() {
    let applier = Applier::new(Arc::new(BrokenStore));
    let err = applier.apply(&delta(DeltaKind::Deleted, "1")).await.unwrap_err();
    assert!(matches!(err, ApplyError::Store(StoreError::BaseUrl(_))));
}

#[tokio::test]
async fn works_through_a_trait_object() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let applier = Applier::new(store);
    assert!(applier.apply(&delta(DeltaKind::Added, "1")).await.unwrap().is_write());
}
