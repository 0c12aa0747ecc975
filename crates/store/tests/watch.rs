#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use unistore_core::{KeyPattern, ResourceError, ResourceKey, Version, WatchEventType, WatchRequest};
use unistore_persist::MemoryProvider;
use unistore_store::{Backend, BackendOptions};

fn key(name: &str) -> ResourceKey { ResourceKey::new("playlist.grafana.app", "playlists", "default", name) }

fn backend(cap: usize) -> Backend {
    let opts = BackendOptions { watch_queue_cap: cap, ..Default::default() };
    Backend::new(Arc::new(MemoryProvider::new()), opts)
}

#[tokio::test]
async fn subscriber_sees_only_writes_after_registration() {
    let b = backend(16);
    let a = key("a");
    b.write(&a, b"v1".to_vec(), None).await.unwrap();
    let mut sub = b.watch(&WatchRequest::live(KeyPattern::exact(&a))).await.unwrap();
    let v2 = b.write(&a, b"v2".to_vec(), None).await.unwrap();
    let ev = sub.recv().await.unwrap().unwrap();
    assert_eq!(ev.event_type, WatchEventType::Modified);
    assert_eq!(ev.version(), v2);
    assert_eq!(ev.resource.value, b"v2");
    assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv()).await.is_err());
}

#[tokio::test]
async fn event_types_follow_mutations() {
    let b = backend(16);
    let mut sub = b.watch(&WatchRequest::live(KeyPattern::collection("playlist.grafana.app", "playlists"))).await.unwrap();
    let k = key("t");
    let v1 = b.write(&k, b"x".to_vec(), None).await.unwrap();
    b.write(&k, b"y".to_vec(), Some(v1)).await.unwrap();
    b.delete(&k, None).await.unwrap();
    // Other collections are filtered out.
    b.write(&ResourceKey::new("other.app", "things", "default", "t"), b"z".to_vec(), None).await.unwrap();
    let mut kinds = Vec::new();
    for _ in 0..3 {
        kinds.push(sub.recv().await.unwrap().unwrap().event_type);
    }
    assert_eq!(kinds, vec![WatchEventType::Added, WatchEventType::Modified, WatchEventType::Deleted]);
    assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_key_events_arrive_in_version_order() {
    let b = Arc::new(backend(4096));
    let mut sub = b.watch(&WatchRequest::live(KeyPattern::all())).await.unwrap();
    let mut tasks = Vec::new();
    for t in 0..4 {
        let b = Arc::clone(&b);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                // Two writers share each key.
                let k = key(&format!("k{}", t % 2));
                b.write(&k, format!("{}-{}", t, i).into_bytes(), None).await.unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    let mut last: [Version; 2] = [0, 0];
    for _ in 0..100 {
        let ev = sub.recv().await.unwrap().unwrap();
        let slot = if ev.key.name == "k0" { 0 } else { 1 };
        assert!(ev.version() > last[slot], "{} after {}", ev.version(), last[slot]);
        last[slot] = ev.version();
    }
}

#[tokio::test]
async fn slow_consumer_is_dropped_and_others_unaffected() {
    let b = backend(4);
    let slow = b.watch(&WatchRequest::live(KeyPattern::all())).await.unwrap();
    let mut fast = b.watch(&WatchRequest::live(KeyPattern::all())).await.unwrap();
    let k = key("busy");
    let mut versions = Vec::new();
    for i in 0..10 {
        // Writes must not stall behind the slow subscriber.
        let v = tokio::time::timeout(Duration::from_secs(1), b.write(&k, format!("{}", i).into_bytes(), None))
            .await
            .expect("write stalled")
            .unwrap();
        versions.push(v);
        assert_eq!(fast.recv().await.unwrap().unwrap().version(), v);
    }
    assert_eq!(b.broadcaster().subscriber_count(), 1);

    let listed = b.list(&Default::default()).await.unwrap();
    assert_eq!(listed.items.len(), 1);

    let mut slow = slow;
    let mut seen = Vec::new();
    let fault = loop {
        match slow.recv().await {
            Some(Ok(ev)) => seen.push(ev.version()),
            Some(Err(e)) => break e,
            None => panic!("subscription ended without a fault"),
        }
    };
    assert_eq!(seen, versions[..4].to_vec());
    assert_eq!(fault, ResourceError::SlowConsumer(slow.id()));
    assert!(slow.recv().await.is_none());
}

#[tokio::test]
async fn watch_since_replays_then_goes_live() {
    let b = backend(16);
    let a = key("a");
    let v1 = b.write(&a, b"1".to_vec(), None).await.unwrap();
    let v2 = b.write(&a, b"2".to_vec(), None).await.unwrap();
    let v3 = b.write(&key("b"), b"3".to_vec(), None).await.unwrap();
    let mut sub = b.watch(&WatchRequest { pattern: KeyPattern::all(), since: Some(v1) }).await.unwrap();
    let v4 = b.write(&a, b"4".to_vec(), None).await.unwrap();
    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(sub.recv().await.unwrap().unwrap().version());
    }
    assert_eq!(got, vec![v2, v3, v4]);
}

#[tokio::test]
async fn oversized_replay_is_rejected() {
    let opts = BackendOptions { replay_max: 2, ..Default::default() };
    let b = Backend::new(Arc::new(MemoryProvider::new()), opts);
    for i in 0..5 {
        b.write(&key(&format!("n{}", i)), b"x".to_vec(), None).await.unwrap();
    }
    let err = b.watch(&WatchRequest { pattern: KeyPattern::all(), since: Some(0) }).await.err().unwrap();
    assert!(matches!(err, ResourceError::Validation(_)));
    assert_eq!(b.broadcaster().subscriber_count(), 0);
}

#[tokio::test]
async fn shutdown_closes_streams() {
    use futures::StreamExt;
    let b = backend(8);
    let sub = b.watch(&WatchRequest::live(KeyPattern::all())).await.unwrap();
    b.write(&key("a"), b"x".to_vec(), None).await.unwrap();
    b.shutdown();
    let items: Vec<_> = sub.into_stream().collect().await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(ResourceError::Closed(_))));
}
