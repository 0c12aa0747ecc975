//! Unistore persistence: pluggable storage providers for versioned resources.
//! Keep providers small and synchronous; async callers go through the backend.

#![forbid(unsafe_code)]

use anyhow::Result;
use serde::{Deserialize, Serialize};
use unistore_core::{KeyPattern, ResourceKey, ResourceWrapper, Version, WatchEvent, WatchEventType};

mod memory;
mod sqlite;

pub use memory::MemoryProvider;
pub use sqlite::SqliteProvider;

/// One row of a key's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: ResourceKey,
    pub resource_version: Version,
    pub action: WatchEventType,
    /// Seconds since epoch at commit time.
    pub ts: i64,
    pub value: Vec<u8>,
}

impl Row {
    pub fn wrapper(&self) -> ResourceWrapper {
        ResourceWrapper { resource_version: self.resource_version, value: self.value.clone() }
    }

    pub fn into_event(self) -> WatchEvent {
        WatchEvent {
            key: self.key,
            event_type: self.action,
            resource: ResourceWrapper { resource_version: self.resource_version, value: self.value },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    Upsert(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: ResourceKey,
    pub kind: MutationKind,
    /// Optimistic-concurrency precondition: the live version the caller last saw.
    /// `Some(0)` means the key must not exist.
    pub expected: Option<Version>,
}

/// Outcome of a commit attempt. Precondition failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    Applied(Row),
    /// `actual` is the live version (0 when the key does not exist).
    Conflict { actual: Version },
    /// Delete of a key with no live version.
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Keep only the newest N history rows per key. `None` keeps everything.
    pub history_limit: Option<usize>,
}

impl ProviderOptions {
    pub fn from_env() -> Self {
        let history_limit = std::env::var("UNISTORE_HISTORY_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0);
        Self { history_limit }
    }
}

/// Durable storage primitives the backend is built on.
///
/// `commit` must be atomic: precondition check, version allocation, history
/// append and live-row update either all happen or none do. Versions come
/// from one counter shared by every key.
pub trait Provider: Send + Sync {
    /// Create schema / prepare the store. Idempotent.
    fn init(&self) -> Result<()> { Ok(()) }

    fn ping(&self) -> Result<()>;

    /// Highest version ever committed (0 for an empty store).
    fn current_version(&self) -> Result<Version>;

    /// Latest live row for a key; `None` when absent or deleted.
    fn latest(&self, key: &ResourceKey) -> Result<Option<Row>>;

    /// A specific retained version, tombstones included.
    fn version(&self, key: &ResourceKey, rv: Version) -> Result<Option<Row>>;

    /// Retained versions for a key, oldest first.
    fn history(&self, key: &ResourceKey) -> Result<Vec<Row>>;

    /// Live rows matching `pattern`, ordered by key, strictly after `start_after`.
    fn list(&self, pattern: &KeyPattern, start_after: Option<&ResourceKey>, limit: usize) -> Result<Vec<Row>>;

    /// Committed rows with version greater than `since`, ordered by version.
    fn changes_since(&self, since: Version, pattern: &KeyPattern, limit: usize) -> Result<Vec<Row>>;

    fn commit(&self, mutation: &Mutation) -> Result<Commit>;
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".unistore");
        let _ = std::fs::create_dir_all(&p);
        p.push("unistore.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "unistore.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub(crate) fn maybe_compress(value: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("UNISTORE_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(packed) = zstd::encode_all(value, lvl) {
            return packed;
        }
    }
    value.to_vec()
}

pub(crate) fn maybe_decompress(blob: Vec<u8>) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(&blob)) {
            return de;
        }
    }
    blob
}

/// Shared precondition check so every provider resolves conflicts identically.
pub(crate) fn check_expected(expected: Option<Version>, live: Option<Version>) -> Option<Commit> {
    let actual = live.unwrap_or(0);
    match expected {
        Some(e) if e != actual => Some(Commit::Conflict { actual }),
        _ => None,
    }
}
