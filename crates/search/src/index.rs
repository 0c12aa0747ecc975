//! Index owner: the document set, its published search view, and the tasks
//! that keep it current (initial scan plus one watch loop per scope).
//!
//! Single writer discipline: only the ingestion path (scan, watch loops and
//! explicit `index_document` calls) takes the document lock. Searches read the
//! last published [`SearchView`] through an `ArcSwap` and never wait on it.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use unistore_core::{
    KeyPattern, ListRequest, ListResponse, ResourceError, ResourceKey, ResourceResult, ResourceWrapper, WatchEvent,
    WatchEventType, WatchRequest,
};
use unistore_store::Subscription;

use crate::document::{DocSet, IndexDocument};
use crate::source::ResourceSource;
use crate::view::{SearchRequest, SearchResponse, SearchView};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum IndexState {
    Uninitialized,
    Building,
    Ready,
    /// A watch loop or the scan failed; the index needs re-initialization.
    Degraded(String),
}

impl IndexState {
    pub fn is_ready(&self) -> bool { matches!(self, IndexState::Ready) }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Uninitialized => "uninitialized",
            IndexState::Building => "building",
            IndexState::Ready => "ready",
            IndexState::Degraded(_) => "degraded",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexState::Degraded(reason) => write!(f, "degraded: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    /// Collections the index covers. Empty means every key.
    pub scopes: Vec<KeyPattern>,
    /// Most watch events applied per view publication.
    pub batch: usize,
    pub page_size: usize,
    /// Attempts per scan page on retryable errors, after the first.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub search_limit: usize,
    pub max_postings_per_key: Option<usize>,
    /// Watch-driven changes are republished to searches at most this often.
    pub publish_interval: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            batch: 256,
            page_size: 500,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            search_limit: 50,
            max_postings_per_key: None,
            publish_interval: Duration::from_millis(50),
        }
    }
}

impl IndexOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        let scopes = std::env::var("UNISTORE_INDEX_SCOPES").ok().map(|s| parse_scopes(&s)).unwrap_or_default();
        let batch = std::env::var("UNISTORE_INDEX_BATCH").ok().and_then(|s| s.parse().ok()).unwrap_or(d.batch);
        let max_retries = std::env::var("UNISTORE_INDEX_MAX_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_retries);
        let max_postings_per_key = std::env::var("UNISTORE_MAX_POSTINGS_PER_KEY").ok().and_then(|s| s.parse().ok());
        let publish_interval = std::env::var("UNISTORE_INDEX_PUBLISH_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.publish_interval);
        Self { scopes, batch, max_retries, max_postings_per_key, publish_interval, ..d }
    }

    pub fn with_scopes(mut self, scopes: Vec<KeyPattern>) -> Self {
        self.scopes = scopes;
        self
    }

    fn effective_scopes(&self) -> Vec<KeyPattern> {
        if self.scopes.is_empty() { vec![KeyPattern::all()] } else { self.scopes.clone() }
    }
}

/// `group/resource` entries, comma separated. Unparseable entries are skipped.
pub fn parse_scopes(s: &str) -> Vec<KeyPattern> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| match KeyPattern::from_str(p) {
            Ok(pat) => Some(pat),
            Err(e) => {
                warn!(scope = p, error = %e, "index: ignoring invalid scope");
                None
            }
        })
        .collect()
}

struct Docs {
    /// Bumped by every (re)initialization; tasks from older generations are ignored.
    generation: u64,
    set: DocSet,
    /// Changes not yet visible to searches.
    dirty: bool,
}

struct Shared {
    opts: IndexOptions,
    docs: Mutex<Docs>,
    view: ArcSwap<SearchView>,
    state: watch::Sender<IndexState>,
}

impl Shared {
    fn docs(&self) -> MutexGuard<'_, Docs> { self.docs.lock().unwrap_or_else(PoisonError::into_inner) }

    fn publish_view(&self, docs: &mut Docs) {
        let view = SearchView::build(docs.set.epoch(), &docs.set.documents(), self.opts.max_postings_per_key);
        self.view.store(Arc::new(view));
        docs.dirty = false;
        counter!("index_view_publish_total", 1u64);
    }

    /// Publish pending changes of generation `gen`. `false` once the
    /// generation is gone.
    fn publish_pending(&self, gen: u64) -> bool {
        let mut docs = self.docs();
        if docs.generation != gen {
            return false;
        }
        if docs.dirty && self.state.borrow().is_ready() {
            self.publish_view(&mut docs);
        }
        true
    }

    /// Apply a batch from the scan or a watch loop. Undecodable payloads are
    /// counted and skipped.
    fn apply_batch(&self, gen: u64, events: &[WatchEvent]) {
        let mut docs = self.docs();
        if docs.generation != gen {
            return;
        }
        let mut changed = 0usize;
        let mut stale = 0usize;
        for ev in events {
            match docs.set.apply(ev) {
                Ok(a) if a.changed() => changed += 1,
                Ok(_) => stale += 1,
                Err(e) => {
                    counter!("index_ingest_errors_total", 1u64);
                    warn!(key = %ev.key, rv = ev.version(), error = %e, "index: skipping undecodable document");
                }
            }
        }
        counter!("index_events_applied_total", changed as u64);
        counter!("index_events_stale_total", stale as u64);
        if changed > 0 {
            docs.dirty = true;
        }
        debug!(gen, events = events.len(), changed, stale, docs = docs.set.len(), "index: batch applied");
    }

    fn mark_ready(&self, gen: u64, took: Duration) {
        let mut docs = self.docs();
        if docs.generation != gen || *self.state.borrow() != IndexState::Building {
            return;
        }
        self.publish_view(&mut docs);
        self.state.send_replace(IndexState::Ready);
        info!(gen, docs = docs.set.len(), took_ms = %took.as_millis(), "index: ready");
    }

    fn degrade(&self, gen: u64, reason: String) {
        let docs = self.docs();
        if docs.generation != gen || matches!(*self.state.borrow(), IndexState::Degraded(_)) {
            return;
        }
        counter!("index_degraded_total", 1u64);
        error!(gen, reason = %reason, "index: degraded");
        self.state.send_replace(IndexState::Degraded(reason));
    }
}

/// Owner of one index instance. Construct with [`ResourceIndex::new`], wire a
/// source with [`ResourceIndex::attach`], then call [`ResourceIndex::init`].
pub struct ResourceIndex {
    shared: Arc<Shared>,
    source: OnceLock<Arc<dyn ResourceSource>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl ResourceIndex {
    pub fn new(opts: IndexOptions) -> Self {
        let (state, _) = watch::channel(IndexState::Uninitialized);
        Self {
            shared: Arc::new(Shared {
                opts,
                docs: Mutex::new(Docs { generation: 0, set: DocSet::new(), dirty: false }),
                view: ArcSwap::from_pointee(SearchView::default()),
                state,
            }),
            source: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Second construction phase: hand the index the source it scans and watches.
    pub fn attach(&self, source: Arc<dyn ResourceSource>) -> ResourceResult<()> {
        self.source
            .set(source)
            .map_err(|_| ResourceError::Validation("index source already attached".to_string()))
    }

    pub fn state(&self) -> IndexState { self.shared.state.borrow().clone() }

    pub fn subscribe_state(&self) -> watch::Receiver<IndexState> { self.shared.state.subscribe() }

    /// Number of live documents.
    pub fn len(&self) -> usize { self.shared.docs().set.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Snapshot of the live documents in key order.
    pub fn documents(&self) -> Vec<Arc<IndexDocument>> { self.shared.docs().set.documents() }

    pub fn get(&self, key: &ResourceKey) -> Option<IndexDocument> { self.shared.docs().set.get(key).cloned() }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for t in tasks.drain(..) {
            t.abort();
        }
    }

    /// (Re)build from scratch. Returns once the index is `Building` with live
    /// subscriptions registered for every scope; the scan continues in the
    /// background and flips the state to `Ready` when it completes.
    pub async fn init(&self) -> ResourceResult<()> {
        let source = self
            .source
            .get()
            .cloned()
            .ok_or_else(|| ResourceError::IndexNotReady("index has no source attached".to_string()))?;
        let _init = self.init_lock.lock().await;
        self.abort_tasks();
        let gen = {
            let mut docs = self.shared.docs();
            docs.generation += 1;
            docs.set.clear();
            docs.dirty = false;
            self.shared.view.store(Arc::new(SearchView::default()));
            self.shared.state.send_replace(IndexState::Building);
            docs.generation
        };
        let scopes = self.shared.opts.effective_scopes();
        info!(gen, scopes = scopes.len(), "index: building");

        // Subscribe before scanning so writes that land during the scan are not missed.
        let mut subs = Vec::with_capacity(scopes.len());
        for scope in scopes.iter() {
            match source.watch(&WatchRequest::live(scope.clone())).await {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    self.shared.degrade(gen, format!("watch {}: {}", scope, e));
                    return Err(e);
                }
            }
        }

        let mut tasks = Vec::with_capacity(subs.len() + 2);
        for sub in subs {
            tasks.push(tokio::spawn(run_watch(Arc::clone(&self.shared), gen, sub)));
        }
        tasks.push(tokio::spawn(run_publisher(Arc::clone(&self.shared), gen)));
        tasks.push(tokio::spawn(run_scan(Arc::clone(&self.shared), gen, source, scopes)));
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;
        Ok(())
    }

    /// Idempotent upsert of one document; `Ok(false)` when the version is not
    /// newer than the stored one.
    pub fn index_document(&self, key: ResourceKey, value: ResourceWrapper) -> ResourceResult<bool> {
        let ev = WatchEvent { key, event_type: WatchEventType::Modified, resource: value };
        let mut docs = self.shared.docs();
        let applied = docs.set.apply(&ev)?;
        if applied.changed() && self.shared.state.borrow().is_ready() {
            self.shared.publish_view(&mut docs);
        }
        debug!(key = %ev.key, rv = ev.version(), changed = applied.changed(), "index: document indexed");
        Ok(applied.changed())
    }

    pub fn search(&self, req: &SearchRequest) -> ResourceResult<SearchResponse> {
        let state = self.state();
        if !state.is_ready() {
            counter!("search_not_ready_total", 1u64);
            return Err(ResourceError::IndexNotReady(state.to_string()));
        }
        let view = self.shared.view.load_full();
        let resp = view.search(&req.query, req.limit.unwrap_or(self.shared.opts.search_limit));
        debug!(query = %req.query, hits = resp.hits.len(), total = resp.total, epoch = view.epoch(), "index: search");
        Ok(resp)
    }

    /// Wait until `Ready`. A `Degraded` index fails immediately.
    pub async fn wait_ready(&self, timeout: Duration) -> ResourceResult<()> {
        let mut rx = self.subscribe_state();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| matches!(s, IndexState::Ready | IndexState::Degraded(_)))).await;
        match waited {
            Err(_) => Err(ResourceError::Timeout(format!("index not ready after {}ms", timeout.as_millis()))),
            Ok(Err(_)) => Err(ResourceError::Closed("index state channel closed".to_string())),
            Ok(Ok(state)) => match &*state {
                IndexState::Ready => Ok(()),
                other => Err(ResourceError::IndexNotReady(other.to_string())),
            },
        }
    }

    /// Stop the scan and watch loops. The state is left as is.
    pub fn shutdown(&self) {
        self.abort_tasks();
        info!("index: stopped");
    }
}

impl Drop for ResourceIndex {
    fn drop(&mut self) { self.abort_tasks(); }
}

async fn run_watch(shared: Arc<Shared>, gen: u64, mut sub: Subscription) {
    let batch_max = shared.opts.batch.max(1);
    let mut batch: Vec<WatchEvent> = Vec::with_capacity(batch_max);
    debug!(gen, id = sub.id(), pattern = %sub.pattern(), "index: watch loop started");
    loop {
        let mut ended = match sub.recv().await {
            Some(Ok(ev)) => {
                batch.push(ev);
                None
            }
            Some(Err(e)) => Some(e.to_string()),
            None => Some("watch stream ended".to_string()),
        };
        // Drain whatever is already queued without waiting.
        while ended.is_none() && batch.len() < batch_max {
            match sub.recv().now_or_never() {
                Some(Some(Ok(ev))) => batch.push(ev),
                Some(Some(Err(e))) => ended = Some(e.to_string()),
                Some(None) => ended = Some("watch stream ended".to_string()),
                None => break,
            }
        }
        if !batch.is_empty() {
            shared.apply_batch(gen, &batch);
            batch.clear();
        }
        if let Some(reason) = ended {
            shared.degrade(gen, format!("watch {}: {}", sub.pattern(), reason));
            return;
        }
    }
}

/// Rebuilds the search view from pending watch changes once per
/// `publish_interval`, so a burst of writes costs one rebuild.
async fn run_publisher(shared: Arc<Shared>, gen: u64) {
    let mut tick = tokio::time::interval(shared.opts.publish_interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if !shared.publish_pending(gen) {
            return;
        }
    }
}

async fn run_scan(shared: Arc<Shared>, gen: u64, source: Arc<dyn ResourceSource>, scopes: Vec<KeyPattern>) {
    let started = Instant::now();
    let mut scanned = 0usize;
    for scope in scopes {
        let mut req = ListRequest { pattern: scope.clone(), limit: Some(shared.opts.page_size), continue_token: None };
        loop {
            let page = match list_with_retry(&shared, source.as_ref(), &req).await {
                Ok(p) => p,
                Err(e) => {
                    shared.degrade(gen, format!("scan {}: {}", scope, e));
                    return;
                }
            };
            scanned += page.items.len();
            let events: Vec<WatchEvent> = page
                .items
                .into_iter()
                .map(|i| WatchEvent { key: i.key, event_type: WatchEventType::Added, resource: i.resource })
                .collect();
            shared.apply_batch(gen, &events);
            match page.next {
                Some(token) => req.continue_token = Some(token),
                None => break,
            }
        }
    }
    debug!(gen, scanned, "index: scan complete");
    shared.mark_ready(gen, started.elapsed());
}

async fn list_with_retry(shared: &Shared, source: &dyn ResourceSource, req: &ListRequest) -> ResourceResult<ListResponse> {
    let mut attempt = 0u32;
    loop {
        match source.list(req).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_retryable() && attempt < shared.opts.max_retries => {
                attempt += 1;
                counter!("index_scan_retries_total", 1u64);
                warn!(pattern = %req.pattern, attempt, error = %e, "index: scan page failed; retrying");
                tokio::time::sleep(shared.opts.retry_backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_parse_from_list() {
        let scopes = parse_scopes("playlist.grafana.app/playlists, dashboard.grafana.app/dashboards,,");
        assert_eq!(scopes, vec![
            KeyPattern::collection("playlist.grafana.app", "playlists"),
            KeyPattern::collection("dashboard.grafana.app", "dashboards"),
        ]);
    }

    #[test]
    fn state_display() {
        assert_eq!(IndexState::Building.to_string(), "building");
        assert_eq!(IndexState::Degraded("boom".into()).to_string(), "degraded: boom");
    }

    #[tokio::test]
    async fn init_without_source_fails() {
        let idx = ResourceIndex::new(IndexOptions::default());
        assert!(matches!(idx.init().await, Err(ResourceError::IndexNotReady(_))));
        assert_eq!(idx.state(), IndexState::Uninitialized);
    }

    #[test]
    fn search_before_init_is_not_ready() {
        let idx = ResourceIndex::new(IndexOptions::default());
        assert!(matches!(idx.search(&SearchRequest::new("")), Err(ResourceError::IndexNotReady(_))));
    }
}
