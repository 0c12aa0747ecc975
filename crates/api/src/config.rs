//! Server options and the feature-flag source selecting plain or indexed mode.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use unistore_search::IndexOptions;
use unistore_store::BackendOptions;

/// Enables the search index.
pub const FLAG_UNIFIED_STORAGE_SEARCH: &str = "unifiedStorageSearch";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    enabled: BTreeSet<String>,
}

impl FeatureToggles {
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { enabled: flags.into_iter().map(Into::into).collect() }
    }

    /// Comma separated flag names from `UNISTORE_FEATURES`.
    pub fn from_env() -> Self {
        let raw = std::env::var("UNISTORE_FEATURES").unwrap_or_default();
        Self::new(raw.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn with(mut self, flag: &str) -> Self {
        self.enabled.insert(flag.to_string());
        self
    }

    pub fn is_enabled(&self, flag: &str) -> bool { self.enabled.contains(flag) }

    pub fn search_enabled(&self) -> bool { self.is_enabled(FLAG_UNIFIED_STORAGE_SEARCH) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Plain,
    Indexed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub backend: BackendOptions,
    pub index: IndexOptions,
    /// Restart a degraded index automatically.
    pub supervise: bool,
    pub restart_backoff: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            index: IndexOptions::default(),
            supervise: true,
            restart_backoff: Duration::from_secs(5),
        }
    }
}

impl ServerOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        let restart_backoff = std::env::var("UNISTORE_INDEX_RESTART_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.restart_backoff);
        Self { backend: BackendOptions::from_env(), index: IndexOptions::from_env(), restart_backoff, ..d }
    }
}
