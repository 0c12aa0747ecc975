#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use unistore_core::{KeyPattern, ListRequest, ResourceError, ResourceKey, WatchEventType};
use unistore_persist::{Commit, MemoryProvider, Mutation, Provider, ProviderOptions, Row, SqliteProvider};
use unistore_store::{Backend, BackendOptions};

fn key(name: &str) -> ResourceKey { ResourceKey::new("playlist.grafana.app", "playlists", "default", name) }

fn mem_backend() -> Backend { Backend::new(Arc::new(MemoryProvider::new()), BackendOptions::default()) }

#[tokio::test]
async fn history_returns_every_write_in_order() {
    let b = mem_backend();
    let k = key("a");
    let values: Vec<String> = (1..=5).map(|i| format!("v{}", i)).collect();
    let mut versions = Vec::new();
    for v in values.iter() {
        versions.push(b.write(&k, v.as_bytes().to_vec(), None).await.unwrap());
    }
    let hist = b.history(&k).await.unwrap();
    let got: Vec<String> = hist.iter().map(|h| String::from_utf8(h.resource.value.clone()).unwrap()).collect();
    assert_eq!(got, values);
    let hv: Vec<i64> = hist.iter().map(|h| h.resource.resource_version).collect();
    assert_eq!(hv, versions);
    assert!(hv.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(hist[0].action, WatchEventType::Added);
    assert!(hist[1..].iter().all(|h| h.action == WatchEventType::Modified));
}

#[tokio::test]
async fn stale_expected_version_conflicts_and_leaves_state() {
    let b = mem_backend();
    let k = key("b");
    let v1 = b.write(&k, b"one".to_vec(), Some(0)).await.unwrap();
    let v2 = b.write(&k, b"two".to_vec(), Some(v1)).await.unwrap();
    let err = b.write(&k, b"three".to_vec(), Some(v1)).await.unwrap_err();
    assert_eq!(err, ResourceError::Conflict { key: k.to_string(), expected: v1, actual: v2 });
    let current = b.read(&k, None).await.unwrap();
    assert_eq!(current.resource_version, v2);
    assert_eq!(current.value, b"two");
    assert_eq!(b.history(&k).await.unwrap().len(), 2);
    // Create-only on an existing key is a conflict too.
    assert!(matches!(b.write(&k, b"x".to_vec(), Some(0)).await, Err(ResourceError::Conflict { .. })));
}

#[tokio::test]
async fn read_specific_and_missing_versions() {
    let b = mem_backend();
    let k = key("c");
    let v1 = b.write(&k, b"one".to_vec(), None).await.unwrap();
    let _v2 = b.write(&k, b"two".to_vec(), None).await.unwrap();
    assert_eq!(b.read(&k, Some(v1)).await.unwrap().value, b"one");
    assert!(matches!(b.read(&k, Some(v1 + 100)).await, Err(ResourceError::NotFound(_))));
    assert!(matches!(b.read(&key("nope"), None).await, Err(ResourceError::NotFound(_))));
    assert!(matches!(b.history(&key("nope")).await, Err(ResourceError::NotFound(_))));
}

#[tokio::test]
async fn delete_hides_key_but_keeps_history() {
    let b = mem_backend();
    let k = key("d");
    let v1 = b.write(&k, b"one".to_vec(), None).await.unwrap();
    let tomb = b.delete(&k, Some(v1)).await.unwrap();
    assert!(tomb > v1);
    assert!(matches!(b.read(&k, None).await, Err(ResourceError::NotFound(_))));
    assert!(matches!(b.read(&k, Some(tomb)).await, Err(ResourceError::NotFound(_))));
    let hist = b.history(&k).await.unwrap();
    assert_eq!(hist.last().unwrap().action, WatchEventType::Deleted);
    assert!(matches!(b.delete(&k, None).await, Err(ResourceError::NotFound(_))));
    let listed = b.list(&ListRequest { pattern: KeyPattern::all(), ..Default::default() }).await.unwrap();
    assert!(listed.items.is_empty());
}

#[tokio::test]
async fn list_pages_with_continue_tokens_over_sqlite() {
    let provider = SqliteProvider::open_in_memory(ProviderOptions::default()).unwrap();
    let b = Backend::new(Arc::new(provider), BackendOptions::default());
    b.init().await.unwrap();
    for n in ["e", "a", "d", "b", "c"] {
        b.write(&key(n), n.as_bytes().to_vec(), None).await.unwrap();
    }
    b.write(&ResourceKey::new("other.app", "things", "default", "x"), b"x".to_vec(), None).await.unwrap();

    let mut names = Vec::new();
    let mut req = ListRequest { pattern: KeyPattern::collection("playlist.grafana.app", "playlists"), limit: Some(2), continue_token: None };
    let mut pages = 0;
    let mut first_rv = None;
    loop {
        let page = b.list(&req).await.unwrap();
        pages += 1;
        first_rv.get_or_insert(page.resource_version);
        assert_eq!(Some(page.resource_version), first_rv);
        names.extend(page.items.iter().map(|i| i.key.name.clone()));
        match page.next {
            Some(tok) => req.continue_token = Some(tok),
            None => break,
        }
    }
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(pages, 3);

    let bad = ListRequest { continue_token: Some("%%%".into()), ..Default::default() };
    assert!(matches!(b.list(&bad).await, Err(ResourceError::Validation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrelated_keys_write_concurrently() {
    let b = Arc::new(mem_backend());
    let mut tasks = Vec::new();
    for t in 0..8 {
        let b = Arc::clone(&b);
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                b.write(&key(&format!("k{}", t)), format!("{}", i).into_bytes(), None).await.unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    for t in 0..8 {
        let hist = b.history(&key(&format!("k{}", t))).await.unwrap();
        assert_eq!(hist.len(), 20);
        assert!(hist.windows(2).all(|w| w[0].resource.resource_version < w[1].resource.resource_version));
    }
    assert_eq!(b.current_version().await.unwrap(), 160);
}

/// Provider whose commits hang, standing in for a stuck database.
struct StuckProvider {
    inner: MemoryProvider,
    delay: Duration,
}

impl Provider for StuckProvider {
    fn ping(&self) -> anyhow::Result<()> { self.inner.ping() }
    fn current_version(&self) -> anyhow::Result<i64> { self.inner.current_version() }
    fn latest(&self, key: &ResourceKey) -> anyhow::Result<Option<Row>> { self.inner.latest(key) }
    fn version(&self, key: &ResourceKey, rv: i64) -> anyhow::Result<Option<Row>> { self.inner.version(key, rv) }
    fn history(&self, key: &ResourceKey) -> anyhow::Result<Vec<Row>> { self.inner.history(key) }
    fn list(&self, pattern: &KeyPattern, start_after: Option<&ResourceKey>, limit: usize) -> anyhow::Result<Vec<Row>> {
        self.inner.list(pattern, start_after, limit)
    }
    fn changes_since(&self, since: i64, pattern: &KeyPattern, limit: usize) -> anyhow::Result<Vec<Row>> {
        self.inner.changes_since(since, pattern, limit)
    }
    fn commit(&self, m: &Mutation) -> anyhow::Result<Commit> {
        std::thread::sleep(self.delay);
        self.inner.commit(m)
    }
}

#[tokio::test]
async fn stuck_storage_times_out() {
    let provider = StuckProvider { inner: MemoryProvider::new(), delay: Duration::from_millis(300) };
    let opts = BackendOptions { storage_timeout: Duration::from_millis(50), ..Default::default() };
    let b = Backend::new(Arc::new(provider), opts);
    let err = b.write(&key("slow"), b"x".to_vec(), None).await.unwrap_err();
    assert!(matches!(err, ResourceError::Timeout(_)));
    assert!(err.is_retryable());
    // Reads do not go through the stuck path.
    assert!(b.is_healthy().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_behind_a_stuck_commit_times_out_too() {
    let provider = StuckProvider { inner: MemoryProvider::new(), delay: Duration::from_millis(1500) };
    let opts = BackendOptions { storage_timeout: Duration::from_millis(50), ..Default::default() };
    let b = Backend::new(Arc::new(provider), opts);
    assert!(matches!(b.write(&key("slow"), b"x".to_vec(), None).await, Err(ResourceError::Timeout(_))));

    // The first commit is still running and holds the key's stripe.
    let started = std::time::Instant::now();
    let err = b.write(&key("slow"), b"y".to_vec(), None).await.unwrap_err();
    assert!(matches!(err, ResourceError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(500), "waited {:?}", started.elapsed());
}
