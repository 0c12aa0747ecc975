//! Backend: versioned writes, reads, listings and history over a [`Provider`],
//! with every committed mutation published to the [`Broadcaster`].

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rustc_hash::FxHasher;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant as Deadline;
use tracing::{debug, info, warn};
use unistore_core::{
    HistoryEntry, KeyedResource, ListRequest, ListResponse, ResourceError, ResourceKey, ResourceResult, ResourceWrapper,
    Version, WatchEventType, WatchRequest,
};
use unistore_persist::{Commit, Mutation, MutationKind, Provider, Row};

use crate::broadcast::{Broadcaster, Subscription};
use crate::token::ContinueToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Bound of each watch subscriber's queue.
    pub watch_queue_cap: usize,
    /// Upper bound on any single storage call.
    pub storage_timeout: Duration,
    pub list_limit: usize,
    pub list_max: usize,
    /// Largest change-log window a watch may replay.
    pub replay_max: usize,
    pub lock_stripes: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            watch_queue_cap: 1024,
            storage_timeout: Duration::from_millis(5000),
            list_limit: 500,
            list_max: 5000,
            replay_max: 10_000,
            lock_stripes: 64,
        }
    }
}

impl BackendOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        let watch_queue_cap = std::env::var("UNISTORE_WATCH_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.watch_queue_cap);
        let storage_timeout = std::env::var("UNISTORE_WRITE_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).map(Duration::from_millis).unwrap_or(d.storage_timeout);
        let list_limit = std::env::var("UNISTORE_LIST_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(d.list_limit);
        let list_max = std::env::var("UNISTORE_LIST_MAX").ok().and_then(|s| s.parse().ok()).unwrap_or(d.list_max);
        let replay_max = std::env::var("UNISTORE_REPLAY_MAX").ok().and_then(|s| s.parse().ok()).unwrap_or(d.replay_max);
        Self { watch_queue_cap, storage_timeout, list_limit, list_max, replay_max, lock_stripes: d.lock_stripes }
    }
}

/// Striped per-key mutexes. Holding a key's stripe across commit + publish keeps
/// events for that key in version order; unrelated keys rarely share a stripe.
struct KeyLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn new(n: usize) -> Self {
        Self { stripes: (0..n.max(1)).map(|_| Arc::new(Mutex::new(()))).collect() }
    }

    async fn lock(&self, key: &ResourceKey) -> OwnedMutexGuard<()> {
        let mut h = FxHasher::default();
        key.hash(&mut h);
        let idx = (h.finish() as usize) % self.stripes.len();
        Arc::clone(&self.stripes[idx]).lock_owned().await
    }
}

pub struct Backend {
    provider: Arc<dyn Provider>,
    broadcaster: Broadcaster,
    locks: KeyLocks,
    opts: BackendOptions,
}

impl Backend {
    pub fn new(provider: Arc<dyn Provider>, opts: BackendOptions) -> Self {
        Self {
            broadcaster: Broadcaster::new(opts.watch_queue_cap),
            locks: KeyLocks::new(opts.lock_stripes),
            provider,
            opts,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster { &self.broadcaster }

    /// Run a provider call on the blocking pool, bounded by `storage_timeout`.
    /// A timed-out call keeps running to completion; only the wait is abandoned.
    async fn blocking<T, F>(&self, op: &'static str, f: F) -> ResourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Provider) -> anyhow::Result<T> + Send + 'static,
    {
        self.blocking_until(op, Deadline::now() + self.opts.storage_timeout, f).await
    }

    async fn blocking_until<T, F>(&self, op: &'static str, deadline: Deadline, f: F) -> ResourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Provider) -> anyhow::Result<T> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let task = tokio::task::spawn_blocking(move || f(provider.as_ref()));
        match tokio::time::timeout_at(deadline, task).await {
            Err(_) => Err(self.timed_out(op)),
            Ok(Err(join)) => Err(ResourceError::Storage(format!("{} task failed: {}", op, join))),
            Ok(Ok(res)) => res.map_err(ResourceError::storage),
        }
    }

    fn timed_out(&self, op: &'static str) -> ResourceError {
        counter!("backend_timeouts_total", 1u64, "op" => op);
        warn!(op, timeout_ms = %self.opts.storage_timeout.as_millis(), "backend: storage call timed out");
        ResourceError::Timeout(format!("{} exceeded {}ms", op, self.opts.storage_timeout.as_millis()))
    }

    pub async fn init(&self) -> ResourceResult<()> {
        self.blocking("init", |p| p.init()).await?;
        info!("backend: storage initialized");
        Ok(())
    }

    pub async fn is_healthy(&self) -> ResourceResult<()> {
        self.blocking("ping", |p| p.ping()).await
    }

    pub async fn current_version(&self) -> ResourceResult<Version> {
        self.blocking("current_version", |p| p.current_version()).await
    }

    /// Create or update `key`. `expected` is the live version the caller last
    /// saw (`Some(0)`: must not exist).
    ///
    /// `Timeout` leaves the outcome unknown: the storage call may still commit.
    /// Retry only with `expected` set, or read the key first.
    pub async fn write(&self, key: &ResourceKey, value: Vec<u8>, expected: Option<Version>) -> ResourceResult<Version> {
        self.mutate(Mutation { key: key.clone(), kind: MutationKind::Upsert(value), expected }).await
    }

    /// Append a tombstone for `key`; returns the tombstone's version.
    pub async fn delete(&self, key: &ResourceKey, expected: Option<Version>) -> ResourceResult<Version> {
        self.mutate(Mutation { key: key.clone(), kind: MutationKind::Delete, expected }).await
    }

    async fn mutate(&self, m: Mutation) -> ResourceResult<Version> {
        let started = Instant::now();
        let key = m.key.clone();
        let expected = m.expected;
        // One deadline covers waiting for the key's stripe and the commit; a
        // timed-out commit can still hold the stripe.
        let deadline = Deadline::now() + self.opts.storage_timeout;
        let guard = match tokio::time::timeout_at(deadline, self.locks.lock(&key)).await {
            Ok(g) => g,
            Err(_) => return Err(self.timed_out("write")),
        };
        let broadcaster = self.broadcaster.clone();
        let commit = self
            .blocking_until("write", deadline, move |p| {
                let _held = guard;
                let commit = p.commit(&m)?;
                if let Commit::Applied(row) = &commit {
                    broadcaster.publish(&row.clone().into_event());
                }
                Ok(commit)
            })
            .await?;
        match commit {
            Commit::Applied(row) => {
                let took = started.elapsed();
                histogram!("backend_write_ms", took.as_secs_f64() * 1000.0);
                counter!("backend_write_total", 1u64, "action" => row.action.as_str());
                debug!(key = %key, rv = row.resource_version, action = row.action.as_str(), took_ms = %took.as_millis(), "backend: write ok");
                Ok(row.resource_version)
            }
            Commit::Conflict { actual } => {
                counter!("backend_conflicts_total", 1u64);
                debug!(key = %key, expected = ?expected, actual, "backend: write conflict");
                Err(ResourceError::Conflict { key: key.to_string(), expected: expected.unwrap_or_default(), actual })
            }
            Commit::Missing => Err(ResourceError::NotFound(key.to_string())),
        }
    }

    /// Latest live version, or a specific retained version.
    pub async fn read(&self, key: &ResourceKey, version: Option<Version>) -> ResourceResult<ResourceWrapper> {
        let k = key.clone();
        let row = self
            .blocking("read", move |p| match version {
                Some(rv) => p.version(&k, rv),
                None => p.latest(&k),
            })
            .await?;
        match row {
            Some(r) if r.action != WatchEventType::Deleted => Ok(r.wrapper()),
            _ => Err(ResourceError::NotFound(match version {
                Some(rv) => format!("{}@{}", key, rv),
                None => key.to_string(),
            })),
        }
    }

    /// One page of live resources ordered by key.
    pub async fn list(&self, req: &ListRequest) -> ResourceResult<ListResponse> {
        let started = Instant::now();
        let limit = req.limit.unwrap_or(self.opts.list_limit).clamp(1, self.opts.list_max.max(1));
        let token = req.continue_token.as_deref().map(ContinueToken::decode).transpose()?;
        let pattern = req.pattern.clone();
        let start_after = token.as_ref().map(|t| t.start_after.clone());
        let (current, mut rows) = self
            .blocking("list", move |p| {
                let current = p.current_version()?;
                let rows = p.list(&pattern, start_after.as_ref(), limit + 1)?;
                Ok((current, rows))
            })
            .await?;
        let resource_version = token.map(|t| t.rv).unwrap_or(current);
        let next = if rows.len() > limit {
            rows.truncate(limit);
            match rows.last() {
                Some(last) => Some(ContinueToken { start_after: last.key.clone(), rv: resource_version }.encode()?),
                None => None,
            }
        } else {
            None
        };
        let items: Vec<KeyedResource> = rows.into_iter().map(|r| KeyedResource { resource: r.wrapper(), key: r.key }).collect();
        histogram!("backend_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(pattern = %req.pattern, items = items.len(), more = next.is_some(), "backend: list ok");
        Ok(ListResponse { items, next, resource_version })
    }

    /// Every retained version of `key`, oldest first, tombstones included.
    pub async fn history(&self, key: &ResourceKey) -> ResourceResult<Vec<HistoryEntry>> {
        let k = key.clone();
        let rows = self.blocking("history", move |p| p.history(&k)).await?;
        if rows.is_empty() {
            return Err(ResourceError::NotFound(key.to_string()));
        }
        Ok(rows.into_iter().map(|r| HistoryEntry { action: r.action, resource: r.wrapper() }).collect())
    }

    /// Register a subscription. Live delivery starts at registration; with
    /// `since`, committed changes after that version are replayed first.
    pub async fn watch(&self, req: &WatchRequest) -> ResourceResult<Subscription> {
        let mut sub = self.broadcaster.subscribe(req.pattern.clone());
        if let Some(since) = req.since {
            let pattern = req.pattern.clone();
            let max = self.opts.replay_max;
            let rows = self.blocking("replay", move |p| p.changes_since(since, &pattern, max + 1)).await?;
            if rows.len() > max {
                return Err(ResourceError::Validation(format!(
                    "replay since {} exceeds {} events; list and watch from the listing version instead",
                    since, max
                )));
            }
            debug!(id = sub.id(), since, replay = rows.len(), "backend: watch replay loaded");
            sub.prime(rows.into_iter().map(Row::into_event).collect(), since);
        }
        info!(id = sub.id(), pattern = %req.pattern, since = ?req.since, "backend: watch registered");
        Ok(sub)
    }

    /// Disconnect all watchers.
    pub fn shutdown(&self) {
        self.broadcaster.close("backend shut down");
        info!("backend: shut down");
    }
}
