//! Unistore public API façade (in-process).
//!
//! Defines the request/response surface frontends depend on and the
//! [`ResourceServer`] that binds the backend, the watch broadcaster and the
//! optional search index behind it.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod config;
mod server;

pub use config::{FeatureToggles, ServerMode, ServerOptions, FLAG_UNIFIED_STORAGE_SEARCH};
pub use server::{new_resource_server, ResourceServer};
pub use unistore_core::prelude::*;
pub use unistore_core::Resource;
pub use unistore_search::{IndexState, SearchHit, SearchRequest, SearchResponse};
pub use unistore_store::Subscription;

/// Index control. Without a key the index is rebuilt from scratch; with a key
/// and value a single document is fed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub key: Option<ResourceKey>,
    pub value: Option<ResourceWrapper>,
}

impl IndexRequest {
    pub fn rebuild() -> Self { Self::default() }

    pub fn document(key: ResourceKey, value: ResourceWrapper) -> Self { Self { key: Some(key), value: Some(value) } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    pub state: IndexState,
    /// For single documents: whether the index changed.
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub mode: ServerMode,
    /// Current version of the store.
    pub resource_version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexState>,
    pub watchers: usize,
}

/// Resource API surface.
#[async_trait::async_trait]
pub trait ResourceApi: Send + Sync {
    /// Latest version of `key`, or the given retained version.
    async fn read(&self, key: &ResourceKey, version: Option<Version>) -> ResourceResult<ResourceWrapper>;

    /// Create or update. `expected = Some(0)` creates only; any other value must
    /// match the live version. On `Timeout` the write may or may not have been
    /// applied; re-read, or retry with `expected` set.
    async fn write(&self, key: &ResourceKey, value: Vec<u8>, expected: Option<Version>) -> ResourceResult<Version>;

    async fn delete(&self, key: &ResourceKey, expected: Option<Version>) -> ResourceResult<Version>;

    async fn list(&self, req: ListRequest) -> ResourceResult<ListResponse>;

    /// Live changes from registration on, after an optional replay.
    async fn watch(&self, req: WatchRequest) -> ResourceResult<Subscription>;

    async fn history(&self, key: &ResourceKey) -> ResourceResult<Vec<HistoryEntry>>;

    /// Indexed mode only; fails with `IndexNotReady` until the index is ready.
    async fn search(&self, req: SearchRequest) -> ResourceResult<SearchResponse>;

    async fn index(&self, req: IndexRequest) -> ResourceResult<IndexResponse>;

    async fn is_healthy(&self) -> ResourceResult<HealthStatus>;
}
