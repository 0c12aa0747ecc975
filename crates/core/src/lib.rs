//! Unistore core types: resource identity, committed versions, watch events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod error;
pub mod resource;

pub use error::{ResourceError, ResourceResult};
pub use resource::{ObjectMeta, Resource};

/// Committed version of a key. Allocated from a single monotonic counter, so it
/// is strictly increasing per key and across the store.
pub type Version = i64;

static GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap());
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.:]*[A-Za-z0-9])?$").unwrap());

const MAX_SEGMENT_LEN: usize = 253;

/// Identity of a resource (not a specific version).
///
/// Field order matters: the derived `Ord` is the listing order
/// (group, resource, namespace, name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub resource: String,
    /// Empty for cluster-scoped resources.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, resource: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), resource: resource.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Check every segment against the allowed charset. Namespace may be empty.
    pub fn validate(&self) -> ResourceResult<()> {
        check_segment("group", &self.group, &GROUP_RE)?;
        check_segment("resource", &self.resource, &GROUP_RE)?;
        if !self.namespace.is_empty() {
            check_segment("namespace", &self.namespace, &GROUP_RE)?;
        }
        check_segment("name", &self.name, &NAME_RE)?;
        Ok(())
    }
}

fn check_segment(field: &str, value: &str, re: &Regex) -> ResourceResult<()> {
    if value.is_empty() {
        return Err(ResourceError::Validation(format!("{} is required", field)));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(ResourceError::Validation(format!("{} exceeds {} characters", field, MAX_SEGMENT_LEN)));
    }
    if !re.is_match(value) {
        return Err(ResourceError::Validation(format!("invalid {}: {:?}", field, value)));
    }
    Ok(())
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.resource, self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = ResourceError;

    /// Parse `group/resource/namespace/name`; the namespace segment may be empty.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [group, resource, namespace, name] => {
                let key = ResourceKey::new(*group, *resource, *namespace, *name);
                key.validate()?;
                Ok(key)
            }
            _ => Err(ResourceError::Validation(format!(
                "invalid key: {} (expect group/resource/namespace/name)",
                s
            ))),
        }
    }
}

/// Filter over resource keys. `None` segments are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPattern {
    pub group: Option<String>,
    pub resource: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl KeyPattern {
    /// Matches every key.
    pub fn all() -> Self { Self::default() }

    /// Matches every key of one group/resource collection.
    pub fn collection(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: Some(group.into()), resource: Some(resource.into()), namespace: None, name: None }
    }

    pub fn exact(key: &ResourceKey) -> Self {
        Self {
            group: Some(key.group.clone()),
            resource: Some(key.resource.clone()),
            namespace: Some(key.namespace.clone()),
            name: Some(key.name.clone()),
        }
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        fn seg(p: &Option<String>, v: &str) -> bool { p.as_deref().map(|p| p == v).unwrap_or(true) }
        seg(&self.group, &key.group)
            && seg(&self.resource, &key.resource)
            && seg(&self.namespace, &key.namespace)
            && seg(&self.name, &key.name)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_string());
        write!(f, "{}/{}/{}/{}", s(&self.group), s(&self.resource), s(&self.namespace), s(&self.name))
    }
}

impl FromStr for KeyPattern {
    type Err = ResourceError;

    /// Parse up to four `/`-separated segments; `*` or an empty segment is a wildcard.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = if s.is_empty() { Vec::new() } else { s.split('/').collect() };
        if parts.len() > 4 {
            return Err(ResourceError::Validation(format!("invalid pattern: {} (at most 4 segments)", s)));
        }
        let seg = |i: usize| -> Option<String> {
            parts.get(i).filter(|p| !p.is_empty() && **p != "*").map(|p| (*p).to_string())
        };
        Ok(Self { group: seg(0), resource: seg(1), namespace: seg(2), name: seg(3) })
    }
}

/// One committed version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceWrapper {
    pub resource_version: Version,
    /// Opaque serialized payload (JSON for resources written through the server).
    pub value: Vec<u8>,
}

/// A resource together with its key, as returned from listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedResource {
    pub key: ResourceKey,
    pub resource: ResourceWrapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "added",
            WatchEventType::Modified => "modified",
            WatchEventType::Deleted => "deleted",
        }
    }
}

/// Projection of a committed mutation. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub key: ResourceKey,
    pub event_type: WatchEventType,
    /// For `Deleted`, the tombstone version carrying the last live value.
    pub resource: ResourceWrapper,
}

impl WatchEvent {
    pub fn version(&self) -> Version { self.resource.resource_version }
}

/// History entry: a committed version and the mutation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: WatchEventType,
    pub resource: ResourceWrapper,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub pattern: KeyPattern,
    pub limit: Option<usize>,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<KeyedResource>,
    /// Present when more items may follow.
    pub next: Option<String>,
    /// Store-wide version observed when the first page was served.
    pub resource_version: Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub pattern: KeyPattern,
    /// Replay committed changes with a version greater than this before going live.
    pub since: Option<Version>,
}

impl WatchRequest {
    pub fn live(pattern: KeyPattern) -> Self { Self { pattern, since: None } }
}

pub mod prelude {
    pub use super::{
        HistoryEntry, KeyPattern, KeyedResource, ListRequest, ListResponse, ResourceError, ResourceKey,
        ResourceResult, ResourceWrapper, Version, WatchEvent, WatchEventType, WatchRequest,
    };
}
