//! In-memory provider. Same semantics as SQLite, nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use metrics::counter;
use unistore_core::{KeyPattern, ResourceKey, Version, WatchEventType};

use crate::{check_expected, now_ts, Commit, Mutation, MutationKind, Provider, ProviderOptions, Row};

#[derive(Default)]
struct MemState {
    rv: Version,
    /// Live version per key, ordered for listing.
    live: BTreeMap<ResourceKey, Version>,
    /// Every retained row, by version.
    log: BTreeMap<Version, Row>,
    /// Retained versions per key, oldest first.
    by_key: HashMap<ResourceKey, Vec<Version>>,
}

pub struct MemoryProvider {
    state: Mutex<MemState>,
    opts: ProviderOptions,
}

impl MemoryProvider {
    pub fn new() -> Self { Self::with_options(ProviderOptions::default()) }

    pub fn with_options(opts: ProviderOptions) -> Self {
        Self { state: Mutex::new(MemState::default()), opts }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>> {
        self.state.lock().map_err(|_| anyhow!("memory provider lock poisoned"))
    }
}

impl Default for MemoryProvider {
    fn default() -> Self { Self::new() }
}

impl Provider for MemoryProvider {
    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn current_version(&self) -> Result<Version> {
        Ok(self.lock()?.rv)
    }

    fn latest(&self, key: &ResourceKey) -> Result<Option<Row>> {
        let st = self.lock()?;
        Ok(st.live.get(key).and_then(|rv| st.log.get(rv)).cloned())
    }

    fn version(&self, key: &ResourceKey, rv: Version) -> Result<Option<Row>> {
        let st = self.lock()?;
        Ok(st.log.get(&rv).filter(|r| &r.key == key).cloned())
    }

    fn history(&self, key: &ResourceKey) -> Result<Vec<Row>> {
        let st = self.lock()?;
        let versions = match st.by_key.get(key) {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };
        Ok(versions.iter().filter_map(|rv| st.log.get(rv)).cloned().collect())
    }

    fn list(&self, pattern: &KeyPattern, start_after: Option<&ResourceKey>, limit: usize) -> Result<Vec<Row>> {
        use std::ops::Bound;
        let st = self.lock()?;
        let lower = match start_after {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };
        let out = st
            .live
            .range((lower, Bound::Unbounded))
            .filter(|(k, _)| pattern.matches(k))
            .filter_map(|(_, rv)| st.log.get(rv))
            .take(limit)
            .cloned()
            .collect();
        Ok(out)
    }

    fn changes_since(&self, since: Version, pattern: &KeyPattern, limit: usize) -> Result<Vec<Row>> {
        let st = self.lock()?;
        let out = st
            .log
            .range(since.saturating_add(1)..)
            .map(|(_, row)| row)
            .filter(|row| pattern.matches(&row.key))
            .take(limit)
            .cloned()
            .collect();
        Ok(out)
    }

    fn commit(&self, m: &Mutation) -> Result<Commit> {
        let mut st = self.lock()?;
        let live = st.live.get(&m.key).copied();
        if let Some(conflict) = check_expected(m.expected, live) {
            return Ok(conflict);
        }
        let (action, value) = match &m.kind {
            MutationKind::Upsert(v) => {
                let action = if live.is_some() { WatchEventType::Modified } else { WatchEventType::Added };
                (action, v.clone())
            }
            MutationKind::Delete => {
                let Some(rv) = live else { return Ok(Commit::Missing) };
                let last = st.log.get(&rv).map(|r| r.value.clone()).unwrap_or_default();
                (WatchEventType::Deleted, last)
            }
        };
        st.rv += 1;
        let rv = st.rv;
        let row = Row { key: m.key.clone(), resource_version: rv, action, ts: now_ts(), value };
        st.log.insert(rv, row.clone());
        st.by_key.entry(m.key.clone()).or_default().push(rv);
        if action == WatchEventType::Deleted {
            st.live.remove(&m.key);
        } else {
            st.live.insert(m.key.clone(), rv);
        }
        if let Some(keep) = self.opts.history_limit {
            let keep = keep.max(1);
            let pruned: Vec<Version> = match st.by_key.get_mut(&m.key) {
                Some(versions) if versions.len() > keep => {
                    let n = versions.len() - keep;
                    versions.drain(..n).collect()
                }
                _ => Vec::new(),
            };
            for old in pruned {
                st.log.remove(&old);
            }
        }
        counter!("persist_commit_total", 1u64);
        Ok(Commit::Applied(row))
    }
}
