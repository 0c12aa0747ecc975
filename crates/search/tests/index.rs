#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use unistore_core::{
    KeyPattern, KeyedResource, ListRequest, ListResponse, ResourceError, ResourceKey, ResourceResult, ResourceWrapper,
    WatchEvent, WatchEventType, WatchRequest,
};
use unistore_persist::MemoryProvider;
use unistore_search::{DocSet, IndexOptions, IndexState, ResourceIndex, ResourceSource, SearchRequest};
use unistore_store::{Backend, BackendOptions, Broadcaster, Subscription};

const GROUP: &str = "playlist.grafana.app";
const RESOURCE: &str = "playlists";

fn key(name: &str) -> ResourceKey { ResourceKey::new(GROUP, RESOURCE, "default", name) }

fn payload(name: &str, title: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "apiVersion": "playlist.grafana.app/v0alpha1",
        "kind": "Playlist",
        "metadata": { "name": name, "namespace": "default", "labels": { "team": "core" } },
        "spec": { "title": title }
    }))
    .unwrap()
}

fn backend() -> Arc<Backend> { Arc::new(Backend::new(Arc::new(MemoryProvider::new()), BackendOptions::default())) }

fn index_over(source: Arc<dyn ResourceSource>) -> ResourceIndex {
    let idx = ResourceIndex::new(IndexOptions { page_size: 2, ..Default::default() });
    idx.attach(source).unwrap();
    idx
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn fingerprint(idx: &ResourceIndex) -> Vec<(String, i64, Vec<u8>)> {
    idx.documents().iter().map(|d| (d.key.to_string(), d.version, d.value.clone())).collect()
}

#[test]
fn newer_version_wins_regardless_of_arrival_order() {
    let idx = ResourceIndex::new(IndexOptions::default());
    let v1 = ResourceWrapper { resource_version: 7, value: payload("a", "new") };
    let v0 = ResourceWrapper { resource_version: 3, value: payload("a", "old") };
    assert!(idx.index_document(key("a"), v1.clone()).unwrap());
    assert!(!idx.index_document(key("a"), v0).unwrap());
    assert!(!idx.index_document(key("a"), v1.clone()).unwrap());
    let stored = idx.get(&key("a")).unwrap();
    assert_eq!(stored.version, 7);
    assert_eq!(stored.value, v1.value);

    let bad = ResourceWrapper { resource_version: 9, value: b"nope".to_vec() };
    assert!(matches!(idx.index_document(key("a"), bad), Err(ResourceError::Validation(_))));
}

#[tokio::test]
async fn live_index_converges_with_rebuild_and_history_replay() {
    let b = backend();
    let live = index_over(b.clone());
    live.init().await.unwrap();
    live.wait_ready(Duration::from_secs(2)).await.unwrap();

    let mut last = 0;
    for i in 0..6 {
        last = b.write(&key(&format!("p{}", i)), payload(&format!("p{}", i), "first"), None).await.unwrap();
    }
    let v = b.write(&key("p1"), payload("p1", "second"), None).await.unwrap();
    last = last.max(v);
    last = last.max(b.delete(&key("p2"), None).await.unwrap());
    last = last.max(b.write(&key("p3"), payload("p3", "third"), None).await.unwrap());
    eventually("live index to catch up", || live.documents().iter().map(|d| d.version).max() == Some(last)).await;

    let rebuilt = index_over(b.clone());
    rebuilt.init().await.unwrap();
    rebuilt.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(fingerprint(&live), fingerprint(&rebuilt));
    assert_eq!(live.len(), 5);

    // Replaying every key's full history from version zero lands on the same set.
    let mut replayed = DocSet::new();
    for i in 0..6 {
        let k = key(&format!("p{}", i));
        for h in b.history(&k).await.unwrap() {
            replayed.apply(&WatchEvent { key: k.clone(), event_type: h.action, resource: h.resource }).unwrap();
        }
    }
    let replayed: Vec<(String, i64, Vec<u8>)> = replayed.documents().iter().map(|d| (d.key.to_string(), d.version, d.value.clone())).collect();
    assert_eq!(replayed, fingerprint(&live));
}

/// Serves a prepared (possibly stale) listing once released; watches go to the backend.
struct GatedSource {
    backend: Arc<Backend>,
    page: Mutex<Option<ListResponse>>,
    gate: Notify,
}

#[async_trait]
impl ResourceSource for GatedSource {
    async fn list(&self, req: &ListRequest) -> ResourceResult<ListResponse> {
        self.gate.notified().await;
        let prepared = self.page.lock().unwrap().take();
        match prepared {
            Some(page) => Ok(page),
            None => self.backend.list(req).await,
        }
    }

    async fn watch(&self, req: &WatchRequest) -> ResourceResult<Subscription> { self.backend.watch(req).await }
}

#[tokio::test]
async fn search_before_scan_completes_is_not_ready() {
    let b = backend();
    b.write(&key("a"), payload("a", "one"), None).await.unwrap();
    let source = Arc::new(GatedSource { backend: b.clone(), page: Mutex::new(None), gate: Notify::new() });
    let idx = index_over(source.clone());
    idx.init().await.unwrap();
    assert_eq!(idx.state(), IndexState::Building);
    let err = idx.search(&SearchRequest::new("")).unwrap_err();
    assert!(matches!(err, ResourceError::IndexNotReady(_)));

    source.gate.notify_one();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    let resp = idx.search(&SearchRequest::new("")).unwrap();
    assert_eq!(resp.hits.len(), 1);
    assert_eq!(resp.hits[0].key, key("a"));
}

#[tokio::test]
async fn writes_during_scan_win_over_stale_listing() {
    let b = backend();
    let a1 = b.write(&key("a"), payload("a", "one"), None).await.unwrap();
    b.write(&key("b"), payload("b", "one"), None).await.unwrap();
    let stale = b.list(&ListRequest { pattern: KeyPattern::all(), ..Default::default() }).await.unwrap();
    assert_eq!(stale.items.len(), 2);

    let source = Arc::new(GatedSource { backend: b.clone(), page: Mutex::new(Some(stale)), gate: Notify::new() });
    let idx = index_over(source.clone());
    idx.init().await.unwrap();

    let a2 = b.write(&key("a"), payload("a", "two"), Some(a1)).await.unwrap();
    let b_gone = b.delete(&key("b"), None).await.unwrap();
    let c1 = b.write(&key("c"), payload("c", "one"), None).await.unwrap();
    eventually("watch events during scan", || idx.get(&key("c")).is_some()).await;
    assert_eq!(idx.state(), IndexState::Building);

    source.gate.notify_one();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    let hits: Vec<(ResourceKey, i64)> = idx.search(&SearchRequest::new("")).unwrap().hits.into_iter().map(|h| (h.key, h.version)).collect();
    assert_eq!(hits, vec![(key("a"), a2), (key("c"), c1)]);
    assert!(b_gone > a1);
}

/// Listing from fixed items; watches are fed by a test-controlled broadcaster.
struct BusSource {
    bus: Broadcaster,
    items: Vec<KeyedResource>,
    failures: Mutex<u32>,
}

#[async_trait]
impl ResourceSource for BusSource {
    async fn list(&self, _req: &ListRequest) -> ResourceResult<ListResponse> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ResourceError::Storage("database is locked".into()));
        }
        Ok(ListResponse { items: self.items.clone(), next: None, resource_version: 1 })
    }

    async fn watch(&self, req: &WatchRequest) -> ResourceResult<Subscription> { Ok(self.bus.subscribe(req.pattern.clone())) }
}

fn bus_source(failures: u32) -> Arc<BusSource> {
    Arc::new(BusSource {
        bus: Broadcaster::new(16),
        items: vec![
            KeyedResource { key: key("a"), resource: ResourceWrapper { resource_version: 1, value: payload("a", "one") } },
            KeyedResource { key: key("broken"), resource: ResourceWrapper { resource_version: 2, value: b"{".to_vec() } },
        ],
        failures: Mutex::new(failures),
    })
}

#[tokio::test]
async fn stream_failure_degrades_and_reinit_recovers() {
    let source = bus_source(0);
    let idx = index_over(source.clone());
    idx.init().await.unwrap();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    // The undecodable document is skipped, not fatal.
    assert_eq!(idx.len(), 1);

    let mut states = idx.subscribe_state();
    source.bus.close("connection reset");
    let degraded = tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| matches!(s, IndexState::Degraded(_))))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(degraded.to_string().contains("connection reset"));
    assert!(matches!(idx.search(&SearchRequest::new("")), Err(ResourceError::IndexNotReady(_))));
    assert!(matches!(idx.wait_ready(Duration::from_millis(10)).await, Err(ResourceError::IndexNotReady(_))));

    idx.init().await.unwrap();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    source.bus.publish(&WatchEvent {
        key: key("z"),
        event_type: WatchEventType::Added,
        resource: ResourceWrapper { resource_version: 10, value: payload("z", "late") },
    });
    eventually("live event after restart", || {
        idx.search(&SearchRequest::new("ns:default")).map(|r| r.total == 2).unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn retryable_scan_errors_are_retried() {
    let source = bus_source(2);
    let idx = ResourceIndex::new(IndexOptions { retry_backoff: Duration::from_millis(1), ..Default::default() });
    idx.attach(source.clone()).unwrap();
    idx.init().await.unwrap();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(idx.len(), 1);

    let exhausted = bus_source(5);
    let idx = ResourceIndex::new(IndexOptions { retry_backoff: Duration::from_millis(1), max_retries: 2, ..Default::default() });
    idx.attach(exhausted).unwrap();
    idx.init().await.unwrap();
    let err = idx.wait_ready(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, ResourceError::IndexNotReady(ref reason) if reason.contains("database is locked")));
}

#[tokio::test]
async fn scopes_limit_what_is_indexed() {
    let b = backend();
    b.write(&key("a"), payload("a", "one"), None).await.unwrap();
    let other = ResourceKey::new("dashboard.grafana.app", "dashboards", "default", "d");
    let dash = serde_json::to_vec(&serde_json::json!({
        "apiVersion": "dashboard.grafana.app/v0alpha1",
        "kind": "Dashboard",
        "metadata": { "name": "d", "namespace": "default" }
    }))
    .unwrap();
    b.write(&other, dash.clone(), None).await.unwrap();

    let idx = ResourceIndex::new(IndexOptions::default().with_scopes(vec![KeyPattern::collection(GROUP, RESOURCE)]));
    idx.attach(b.clone()).unwrap();
    assert!(idx.attach(b.clone()).is_err());
    idx.init().await.unwrap();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    b.write(&other, dash, None).await.unwrap();
    b.write(&key("b"), payload("b", "one"), None).await.unwrap();
    eventually("in-scope write", || {
        idx.search(&SearchRequest::new("label:team=core")).map(|r| r.total == 2).unwrap_or(false)
    })
    .await;
    assert!(idx.get(&other).is_none());
    let resp = idx.search(&SearchRequest::new("k:dashboard")).unwrap();
    assert!(resp.hits.is_empty());
}

#[tokio::test]
async fn watch_bursts_are_published_together() {
    let b = backend();
    let idx = ResourceIndex::new(IndexOptions { publish_interval: Duration::from_millis(1000), ..Default::default() });
    idx.attach(b.clone()).unwrap();
    idx.init().await.unwrap();
    idx.wait_ready(Duration::from_secs(2)).await.unwrap();
    // Let the publisher's immediate first tick pass.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for i in 0..50 {
        let name = format!("burst{}", i);
        b.write(&key(&name), payload(&name, "x"), None).await.unwrap();
    }
    eventually("documents ingested", || idx.len() == 50).await;
    // Ingested but not yet visible: searches see the last published view.
    assert!(idx.search(&SearchRequest::new("")).unwrap().total < 50);

    let mut total = 0;
    for _ in 0..200 {
        total = idx.search(&SearchRequest::new("")).unwrap().total;
        if total == 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(total, 50);
}
