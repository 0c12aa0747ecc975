//! In-process resource server.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use unistore_core::{
    HistoryEntry, ListRequest, ListResponse, Resource, ResourceError, ResourceKey, ResourceResult, ResourceWrapper,
    Version, WatchRequest,
};
use unistore_persist::Provider;
use unistore_search::{IndexState, ResourceIndex, ResourceSource, SearchRequest, SearchResponse};
use unistore_store::{Backend, Subscription};

use crate::config::{FeatureToggles, ServerMode, ServerOptions};
use crate::{HealthStatus, IndexRequest, IndexResponse, ResourceApi};

fn request_id() -> String { uuid::Uuid::new_v4().simple().to_string()[..8].to_string() }

/// Log and count the outcome of one request.
fn observe<T>(op: &'static str, rid: &str, t0: Instant, res: &ResourceResult<T>) {
    let took_ms = t0.elapsed().as_millis();
    match res {
        Ok(_) => {
            counter!("api_requests_total", 1u64, "op" => op, "outcome" => "ok");
            debug!(rid, op, took_ms = %took_ms, "api: ok");
        }
        Err(e) => {
            let outcome = match e {
                ResourceError::NotFound(_) => "not_found",
                ResourceError::Conflict { .. } => "conflict",
                ResourceError::Validation(_) => "invalid",
                ResourceError::IndexNotReady(_) => "not_ready",
                _ => "error",
            };
            counter!("api_requests_total", 1u64, "op" => op, "outcome" => outcome);
            if outcome == "error" {
                warn!(rid, op, error = %e, took_ms = %took_ms, "api: failed");
            } else {
                debug!(rid, op, error = %e, took_ms = %took_ms, "api: rejected");
            }
        }
    }
}

/// Backend plus, in indexed mode, the index owner. Built in two phases:
/// [`ResourceServer::new`] assembles the parts, [`ResourceServer::wire`] hands
/// the index its source. [`new_resource_server`] does both and starts the index.
pub struct ResourceServer {
    backend: Arc<Backend>,
    index: Option<Arc<ResourceIndex>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    opts: ServerOptions,
}

impl ResourceServer {
    pub fn new(provider: Arc<dyn Provider>, opts: ServerOptions, mode: ServerMode) -> Self {
        let backend = Arc::new(Backend::new(provider, opts.backend.clone()));
        let index = match mode {
            ServerMode::Plain => None,
            ServerMode::Indexed => Some(Arc::new(ResourceIndex::new(opts.index.clone()))),
        };
        Self { backend, index, supervisor: Mutex::new(None), opts }
    }

    /// Give the index the backend to scan and watch. Plain mode: no-op.
    pub fn wire(&self) -> ResourceResult<()> {
        if let Some(index) = &self.index {
            index.attach(Arc::clone(&self.backend) as Arc<dyn ResourceSource>)?;
        }
        Ok(())
    }

    pub fn mode(&self) -> ServerMode {
        if self.index.is_some() { ServerMode::Indexed } else { ServerMode::Plain }
    }

    pub fn backend(&self) -> &Arc<Backend> { &self.backend }

    pub fn search_index(&self) -> Option<&Arc<ResourceIndex>> { self.index.as_ref() }

    fn require_index(&self) -> ResourceResult<&Arc<ResourceIndex>> {
        self.index
            .as_ref()
            .ok_or_else(|| ResourceError::Validation(format!("search is disabled; enable the {} feature", crate::FLAG_UNIFIED_STORAGE_SEARCH)))
    }

    /// Block until the index is ready (indexed mode only).
    pub async fn wait_ready(&self, timeout: Duration) -> ResourceResult<()> { self.require_index()?.wait_ready(timeout).await }

    /// Restart the index whenever it degrades. Idempotent.
    pub fn spawn_supervisor(&self) {
        let Some(index) = self.index.clone() else { return };
        let mut slot = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let backoff = self.opts.restart_backoff;
        *slot = Some(tokio::spawn(async move {
            let mut states = index.subscribe_state();
            loop {
                let reason = match states.wait_for(|s| matches!(s, IndexState::Degraded(_))).await {
                    Ok(s) => s.to_string(),
                    Err(_) => break,
                };
                counter!("index_restarts_total", 1u64);
                warn!(reason = %reason, backoff_ms = %backoff.as_millis(), "supervisor: index degraded; restarting");
                tokio::time::sleep(backoff).await;
                match index.init().await {
                    Ok(()) => info!("supervisor: index rebuilding"),
                    Err(e) => error!(error = %e, "supervisor: index restart failed"),
                }
            }
            debug!("supervisor: stopped");
        }));
    }

    /// Stop background work and disconnect watchers.
    pub fn shutdown(&self) {
        if let Some(task) = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        if let Some(index) = &self.index {
            index.shutdown();
        }
        self.backend.shutdown();
    }

    fn validate_payload(key: &ResourceKey, value: &[u8]) -> ResourceResult<Resource> {
        key.validate()?;
        let r = Resource::decode(value)?;
        r.check_identity(key)?;
        Ok(r)
    }
}

impl Drop for ResourceServer {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Build a server for `provider`. In indexed mode this returns once the index
/// is `Building`; searches fail with `IndexNotReady` until the scan completes.
pub async fn new_resource_server(
    provider: Arc<dyn Provider>,
    opts: ServerOptions,
    features: &FeatureToggles,
) -> ResourceResult<Arc<ResourceServer>> {
    let mode = if features.search_enabled() { ServerMode::Indexed } else { ServerMode::Plain };
    let supervise = opts.supervise;
    let server = ResourceServer::new(provider, opts, mode);
    server.backend.init().await?;
    if mode == ServerMode::Indexed {
        server.wire()?;
        server.index(IndexRequest::rebuild()).await?;
        if supervise {
            server.spawn_supervisor();
        }
    }
    info!(mode = ?mode, "api: resource server ready");
    Ok(Arc::new(server))
}

#[async_trait::async_trait]
impl ResourceApi for ResourceServer {
    async fn read(&self, key: &ResourceKey, version: Option<Version>) -> ResourceResult<ResourceWrapper> {
        let (rid, t0) = (request_id(), Instant::now());
        debug!(rid = %rid, key = %key, version = ?version, "api: read");
        let res = self.backend.read(key, version).await;
        observe("read", &rid, t0, &res);
        res
    }

    async fn write(&self, key: &ResourceKey, value: Vec<u8>, expected: Option<Version>) -> ResourceResult<Version> {
        let (rid, t0) = (request_id(), Instant::now());
        let res = match Self::validate_payload(key, &value) {
            Ok(r) => {
                debug!(rid = %rid, key = %key, kind = %r.kind, expected = ?expected, bytes = value.len(), "api: write");
                self.backend.write(key, value, expected).await
            }
            Err(e) => Err(e),
        };
        if let Ok(rv) = &res {
            info!(rid = %rid, key = %key, rv = *rv, took_ms = %t0.elapsed().as_millis(), "api: write ok");
        }
        observe("write", &rid, t0, &res);
        res
    }

    async fn delete(&self, key: &ResourceKey, expected: Option<Version>) -> ResourceResult<Version> {
        let (rid, t0) = (request_id(), Instant::now());
        let res = match key.validate() {
            Ok(()) => self.backend.delete(key, expected).await,
            Err(e) => Err(e),
        };
        if let Ok(rv) = &res {
            info!(rid = %rid, key = %key, rv = *rv, "api: delete ok");
        }
        observe("delete", &rid, t0, &res);
        res
    }

    async fn list(&self, req: ListRequest) -> ResourceResult<ListResponse> {
        let (rid, t0) = (request_id(), Instant::now());
        debug!(rid = %rid, pattern = %req.pattern, limit = ?req.limit, "api: list");
        let res = self.backend.list(&req).await;
        observe("list", &rid, t0, &res);
        res
    }

    async fn watch(&self, req: WatchRequest) -> ResourceResult<Subscription> {
        let (rid, t0) = (request_id(), Instant::now());
        let res = self.backend.watch(&req).await;
        if let Ok(sub) = &res {
            info!(rid = %rid, id = sub.id(), pattern = %req.pattern, since = ?req.since, "api: watch open");
        }
        observe("watch", &rid, t0, &res);
        res
    }

    async fn history(&self, key: &ResourceKey) -> ResourceResult<Vec<HistoryEntry>> {
        let (rid, t0) = (request_id(), Instant::now());
        let res = self.backend.history(key).await;
        observe("history", &rid, t0, &res);
        res
    }

    async fn search(&self, req: SearchRequest) -> ResourceResult<SearchResponse> {
        let (rid, t0) = (request_id(), Instant::now());
        debug!(rid = %rid, query = %req.query, limit = ?req.limit, "api: search");
        let res = self.require_index().and_then(|index| index.search(&req));
        observe("search", &rid, t0, &res);
        res
    }

    async fn index(&self, req: IndexRequest) -> ResourceResult<IndexResponse> {
        let (rid, t0) = (request_id(), Instant::now());
        let res = match self.require_index() {
            Err(e) => Err(e),
            Ok(index) => match (req.key, req.value) {
                (None, _) => {
                    info!(rid = %rid, "api: index rebuild requested");
                    index.init().await.map(|()| IndexResponse { state: index.state(), indexed: false })
                }
                (Some(key), Some(value)) => key
                    .validate()
                    .and_then(|()| index.index_document(key, value))
                    .map(|indexed| IndexResponse { state: index.state(), indexed }),
                (Some(key), None) => Err(ResourceError::Validation(format!("index request for {} has no value", key))),
            },
        };
        observe("index", &rid, t0, &res);
        res
    }

    async fn is_healthy(&self) -> ResourceResult<HealthStatus> {
        self.backend.is_healthy().await?;
        Ok(HealthStatus {
            mode: self.mode(),
            resource_version: self.backend.current_version().await?,
            index: self.index.as_ref().map(|i| i.state()),
            watchers: self.backend.broadcaster().subscriber_count(),
        })
    }
}
