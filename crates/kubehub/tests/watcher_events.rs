#![forbid(unsafe_code)]

use std::time::Duration;

use futures::stream::{self, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kubist_core::{Delta, DeltaKind};
use kubist_kubehub::{EventStream, ResourceWatcher, WatchError, WatchTarget};
use serde_json::json;
use tokio::sync::mpsc;

fn pod(name: &str, rv: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": "default",
            "resourceVersion": rv,
            "managedFields": [{"manager": "kubectl"}]
        },
        "spec": {"nodeName": "n1"}
    }))
    .unwrap()
}

fn target(events: Vec<Result<Event<DynamicObject>, watcher::Error>>) -> WatchTarget {
    WatchTarget { resource: "v1/pods".into(), kind: "Pod".into(), events: stream::iter(events).boxed() }
}

async fn collect(mut rx: mpsc::Receiver<Delta>) -> Vec<(DeltaKind, String, String)> {
    let mut out = Vec::new();
    while let Some(d) = rx.recv().await {
        out.push((d.kind, d.document_id(), d.object.resource_version.clone()));
    }
    out
}

fn row(kind: DeltaKind, name: &str, rv: &str) -> (DeltaKind, String, String) {
    (kind, format!("Pod/default/{}", name), rv.to_string())
}

#[tokio::test]
async fn initial_list_then_watch_events_map_in_order() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Restarted(vec![pod("a", "1"), pod("b", "2")])),
        Ok(Event::Applied(pod("a", "3"))),
        Ok(Event::Applied(pod("c", "4"))),
        Ok(Event::Deleted(pod("b", "5"))),
    ]));
    let rx = w.watch().unwrap();
    let got = collect(rx).await;
    assert_eq!(
        got,
        vec![
            row(DeltaKind::Sync, "a", "1"),
            row(DeltaKind::Sync, "b", "2"),
            row(DeltaKind::Updated, "a", "3"),
            row(DeltaKind::Added, "c", "4"),
            row(DeltaKind::Deleted, "b", "5"),
        ]
    );
    let stats = w.join().await.unwrap();
    assert_eq!((stats.synced, stats.updated, stats.added, stats.deleted), (2, 1, 1, 1));
}

#[tokio::test]
async fn delete_for_untracked_id_is_dropped() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Applied(pod("a", "1"))),
        Ok(Event::Deleted(pod("a", "2"))),
        Ok(Event::Deleted(pod("a", "2"))),
        Ok(Event::Deleted(pod("ghost", "3"))),
    ]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(got, vec![row(DeltaKind::Added, "a", "1"), row(DeltaKind::Deleted, "a", "2")]);
    assert_eq!(w.join().await.unwrap().dropped_deletes, 2);
}

#[tokio::test]
async fn relist_emits_tombstones_for_vanished_objects() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Restarted(vec![pod("a", "1"), pod("b", "2"), pod("c", "3")])),
        Ok(Event::Restarted(vec![pod("b", "7")])),
    ]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(
        got,
        vec![
            row(DeltaKind::Sync, "a", "1"),
            row(DeltaKind::Sync, "b", "2"),
            row(DeltaKind::Sync, "c", "3"),
            row(DeltaKind::Sync, "b", "7"),
            row(DeltaKind::Deleted, "a", "1"),
            row(DeltaKind::Deleted, "c", "3"),
        ]
    );
}

#[tokio::test]
async fn managed_fields_are_stripped_from_delivered_objects() {
    let mut w = ResourceWatcher::new(target(vec![Ok(Event::Applied(pod("a", "1")))]));
    let mut rx = w.watch().unwrap();
    let d = rx.recv().await.unwrap();
    assert!(d.object.body["metadata"].get("managedFields").is_none());
    assert_eq!(d.object.body["spec"]["nodeName"], json!("n1"));
}

#[tokio::test]
async fn stop_closes_the_stream() {
    let events: EventStream = stream::pending().boxed();
    let mut w = ResourceWatcher::new(WatchTarget { resource: "v1/pods".into(), kind: "Pod".into(), events });
    let mut rx = w.watch().unwrap();
    w.stop();
    let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(w.join().await.unwrap(), Default::default());
}

#[tokio::test]
async fn source_error_is_fatal() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Applied(pod("a", "1"))),
        Err(watcher::Error::NoResourceVersion),
        Ok(Event::Applied(pod("b", "2"))),
    ]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(got, vec![row(DeltaKind::Added, "a", "1")]);
    let err = w.join().await.unwrap_err();
    assert!(matches!(err, WatchError::Source { ref resource, .. } if resource == "v1/pods"), "err={}", err);
}

fn watch_error(code: u16, reason: &str) -> watcher::Error {
    watcher::Error::WatchError(
        serde_json::from_value(json!({"status": "Failure", "message": reason, "reason": reason, "code": code})).unwrap(),
    )
}

#[tokio::test]
async fn expired_watch_recovers_through_the_relist() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Restarted(vec![pod("a", "1"), pod("b", "2")])),
        Err(watch_error(410, "Expired")),
        Ok(Event::Restarted(vec![pod("a", "5")])),
    ]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(
        got,
        vec![
            row(DeltaKind::Sync, "a", "1"),
            row(DeltaKind::Sync, "b", "2"),
            row(DeltaKind::Sync, "a", "5"),
            row(DeltaKind::Deleted, "b", "2"),
        ]
    );
    let stats = w.join().await.unwrap();
    assert_eq!(stats.synced, 3);
    assert_eq!(stats.deleted, 1);
}

#[tokio::test]
async fn other_watch_errors_stay_fatal() {
    let mut w = ResourceWatcher::new(target(vec![
        Ok(Event::Restarted(vec![pod("a", "1")])),
        Err(watch_error(500, "InternalError")),
        Ok(Event::Restarted(vec![pod("a", "5")])),
    ]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(got, vec![row(DeltaKind::Sync, "a", "1")]);
    assert!(matches!(w.join().await, Err(WatchError::Source { .. })));
}

#[tokio::test]
async fn watch_can_only_start_once() {
    let mut w = ResourceWatcher::new(target(vec![]));
    let _rx = w.watch().unwrap();
    assert!(matches!(w.watch(), Err(WatchError::AlreadyStarted(_))));
}

#[tokio::test]
async fn periodic_resync_replays_known_objects() {
    let events: EventStream =
        stream::iter(vec![Ok(Event::Restarted(vec![pod("a", "1")]))]).chain(stream::pending()).boxed();
    let mut w = ResourceWatcher::new(WatchTarget { resource: "v1/pods".into(), kind: "Pod".into(), events })
        .with_resync(Some(Duration::from_millis(20)));
    let mut rx = w.watch().unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, DeltaKind::Sync);
    let again = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(again.kind, DeltaKind::Sync);
    assert_eq!(again.document_id(), "Pod/default/a");

    w.stop();
    let stats = w.join().await.unwrap();
    assert!(stats.synced >= 2);
}

#[tokio::test]
async fn list_items_without_kind_take_the_resource_kind() {
    let bare: DynamicObject = serde_json::from_value(json!({
        "metadata": {"name": "x", "namespace": "default", "resourceVersion": "9"}
    }))
    .unwrap();
    let mut w = ResourceWatcher::new(target(vec![Ok(Event::Restarted(vec![bare]))]));
    let got = collect(w.watch().unwrap()).await;
    assert_eq!(got, vec![row(DeltaKind::Sync, "x", "9")]);
}
