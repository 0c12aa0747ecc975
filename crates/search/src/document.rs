//! Index documents and the version-deduplicated set they live in.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use unistore_core::{Resource, ResourceKey, ResourceResult, ResourceWrapper, Version, WatchEvent, WatchEventType};

/// Latest observed version of one key, with the fields search needs.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub key: ResourceKey,
    pub version: Version,
    pub value: Vec<u8>,
    /// Lowercased `kind` of the decoded payload.
    pub kind: String,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
    /// `metadata.creationTimestamp` as unix seconds, when present and valid.
    pub created: Option<i64>,
}

impl IndexDocument {
    pub fn decode(key: ResourceKey, wrapper: &ResourceWrapper) -> ResourceResult<Self> {
        let r = Resource::decode(&wrapper.value)?;
        let created = r
            .metadata
            .creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());
        Ok(Self {
            kind: r.kind.to_ascii_lowercase(),
            labels: r.labels(),
            annotations: r.annotations(),
            created,
            key,
            version: wrapper.resource_version,
            value: wrapper.value.clone(),
        })
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Live(Arc<IndexDocument>),
    /// Deleted at this version; keeps late, older upserts from resurrecting the key.
    Gone(Version),
}

impl Slot {
    fn version(&self) -> Version {
        match self {
            Slot::Live(d) => d.version,
            Slot::Gone(v) => *v,
        }
    }
}

/// What applying one change did to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Version at or below what is already stored.
    Stale,
}

impl Applied {
    pub fn changed(self) -> bool { self != Applied::Stale }
}

/// At most one document per key, always the newest version seen.
#[derive(Debug, Default)]
pub struct DocSet {
    slots: FxHashMap<ResourceKey, Slot>,
    live: usize,
    epoch: u64,
}

impl DocSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.live }

    pub fn is_empty(&self) -> bool { self.live == 0 }

    /// Bumped on every change; views carry the epoch they were built from.
    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn get(&self, key: &ResourceKey) -> Option<&IndexDocument> {
        match self.slots.get(key) {
            Some(Slot::Live(d)) => Some(d),
            _ => None,
        }
    }

    /// Version stored for `key`, live or deleted.
    pub fn version_of(&self, key: &ResourceKey) -> Option<Version> {
        self.slots.get(key).map(Slot::version)
    }

    fn is_stale(&self, key: &ResourceKey, version: Version) -> bool {
        self.version_of(key).map(|v| version <= v).unwrap_or(false)
    }

    /// Idempotent upsert.
    pub fn upsert(&mut self, doc: IndexDocument) -> Applied {
        if self.is_stale(&doc.key, doc.version) {
            return Applied::Stale;
        }
        let key = doc.key.clone();
        let prev = self.slots.insert(key, Slot::Live(Arc::new(doc)));
        self.epoch += 1;
        match prev {
            Some(Slot::Live(_)) => Applied::Updated,
            _ => {
                self.live += 1;
                Applied::Inserted
            }
        }
    }

    pub fn remove(&mut self, key: &ResourceKey, version: Version) -> Applied {
        if self.is_stale(key, version) {
            return Applied::Stale;
        }
        let prev = self.slots.insert(key.clone(), Slot::Gone(version));
        self.epoch += 1;
        if let Some(Slot::Live(_)) = prev {
            self.live -= 1;
        }
        Applied::Removed
    }

    /// Apply a watch event. Payloads are decoded only when the version is new.
    pub fn apply(&mut self, ev: &WatchEvent) -> ResourceResult<Applied> {
        if self.is_stale(&ev.key, ev.version()) {
            return Ok(Applied::Stale);
        }
        match ev.event_type {
            WatchEventType::Deleted => Ok(self.remove(&ev.key, ev.version())),
            WatchEventType::Added | WatchEventType::Modified => {
                let doc = IndexDocument::decode(ev.key.clone(), &ev.resource)?;
                Ok(self.upsert(doc))
            }
        }
    }

    /// Live documents in key order.
    pub fn documents(&self) -> Vec<Arc<IndexDocument>> {
        let mut docs: Vec<Arc<IndexDocument>> = self
            .slots
            .values()
            .filter_map(|s| match s {
                Slot::Live(d) => Some(Arc::clone(d)),
                Slot::Gone(_) => None,
            })
            .collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        docs
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.live = 0;
        self.epoch += 1;
    }
}
