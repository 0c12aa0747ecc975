//! Immutable search view built from a document set.
//! Flat layout: parallel per-document columns plus label/annotation postings.

use std::sync::Arc;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use unistore_core::{ResourceKey, Version};

use crate::document::IndexDocument;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Maximum hits returned; `None` uses the index default.
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self { Self { query: query.into(), limit: None } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: ResourceKey,
    pub version: Version,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDebugInfo {
    pub docs: usize,
    pub after_scope: usize,
    pub after_label_keys: usize,
    pub after_labels: usize,
    pub after_anno_keys: usize,
    pub after_annos: usize,
    pub matched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Matches before `limit` was applied.
    pub total: usize,
    pub debug: SearchDebugInfo,
}

#[derive(Default)]
pub struct SearchView {
    epoch: u64,
    keys: Vec<ResourceKey>,
    versions: Vec<Version>,
    created: Vec<Option<i64>>,
    kinds: Vec<String>,
    texts: Vec<String>,
    label_post: FxHashMap<String, Vec<usize>>,     // key=value
    label_key_post: FxHashMap<String, Vec<usize>>, // key
    anno_post: FxHashMap<String, Vec<usize>>,
    anno_key_post: FxHashMap<String, Vec<usize>>,
    truncated_keys: usize,
}

/// Parsed query. Unknown `prefix:` tokens are treated as free text.
#[derive(Debug, Default)]
struct Query<'a> {
    ns: Option<&'a str>,
    groups: Vec<&'a str>,
    resources: Vec<&'a str>,
    kinds: Vec<&'a str>,
    labels: Vec<&'a str>,
    label_keys: Vec<&'a str>,
    annos: Vec<&'a str>,
    anno_keys: Vec<&'a str>,
    free: Vec<&'a str>,
}

impl<'a> Query<'a> {
    fn parse(q: &'a str) -> Self {
        let mut out = Query::default();
        for tok in q.split_whitespace() {
            if let Some(rest) = tok.strip_prefix("ns:") { out.ns = Some(rest); continue; }
            if let Some(rest) = tok.strip_prefix("g:") { if !rest.is_empty() { out.groups.push(rest); continue; } }
            if let Some(rest) = tok.strip_prefix("r:") { if !rest.is_empty() { out.resources.push(rest); continue; } }
            if let Some(rest) = tok.strip_prefix("k:") { if !rest.is_empty() { out.kinds.push(rest); continue; } }
            if let Some(rest) = tok.strip_prefix("label:") {
                if rest.contains('=') { out.labels.push(rest); continue; }
                if !rest.is_empty() { out.label_keys.push(rest); continue; }
            }
            if let Some(rest) = tok.strip_prefix("anno:") {
                if rest.contains('=') { out.annos.push(rest); continue; }
                if !rest.is_empty() { out.anno_keys.push(rest); continue; }
            }
            out.free.push(tok);
        }
        out
    }
}

fn push_capped(post: &mut Vec<usize>, i: usize, cap: Option<usize>) -> bool {
    match cap {
        Some(c) if post.len() >= c => false,
        _ => {
            post.push(i);
            true
        }
    }
}

fn narrow(candidates: &mut Vec<usize>, post: &FxHashMap<String, Vec<usize>>, keys: &[&str]) {
    for key in keys {
        match post.get(*key) {
            Some(p) => *candidates = intersect_sorted(candidates, p),
            None => candidates.clear(),
        }
    }
}

fn intersect_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut i = 0usize;
    let mut j = 0usize;
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => { out.push(a[i]); i += 1; j += 1; }
        }
    }
    out
}

impl SearchView {
    /// `docs` must be in key order; ties in score fall back to that order.
    pub fn build(epoch: u64, docs: &[Arc<IndexDocument>], postings_cap: Option<usize>) -> Self {
        let n = docs.len();
        let mut v = SearchView {
            epoch,
            keys: Vec::with_capacity(n),
            versions: Vec::with_capacity(n),
            created: Vec::with_capacity(n),
            kinds: Vec::with_capacity(n),
            texts: Vec::with_capacity(n),
            ..Default::default()
        };
        for (i, d) in docs.iter().enumerate() {
            let mut text = String::new();
            if !d.key.namespace.is_empty() { text.push_str(&d.key.namespace); text.push('/'); }
            text.push_str(&d.key.name);
            for (k, val) in d.labels.iter() { text.push(' '); text.push_str(k); text.push(':'); text.push_str(val); }
            v.texts.push(text);
            v.keys.push(d.key.clone());
            v.versions.push(d.version);
            v.created.push(d.created);
            v.kinds.push(d.kind.clone());

            for (k, val) in d.labels.iter() {
                if !push_capped(v.label_post.entry(format!("{}={}", k, val)).or_default(), i, postings_cap) {
                    v.truncated_keys += 1;
                }
                push_capped(v.label_key_post.entry(k.clone()).or_default(), i, postings_cap);
            }
            for (k, val) in d.annotations.iter() {
                if !push_capped(v.anno_post.entry(format!("{}={}", k, val)).or_default(), i, postings_cap) {
                    v.truncated_keys += 1;
                }
                push_capped(v.anno_key_post.entry(k.clone()).or_default(), i, postings_cap);
            }
        }
        metrics::gauge!("index_docs", n as f64);
        metrics::gauge!("index_bytes", v.approx_bytes() as f64);
        metrics::gauge!("index_postings_truncated_keys", v.truncated_keys as f64);
        v
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn len(&self) -> usize { self.keys.len() }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    fn approx_bytes(&self) -> usize {
        let slot = std::mem::size_of::<usize>();
        let mut b = 0usize;
        b += self.texts.iter().map(|s| s.len()).sum::<usize>();
        b += self.kinds.iter().map(|s| s.len()).sum::<usize>();
        b += self.keys.iter().map(|k| k.group.len() + k.resource.len() + k.namespace.len() + k.name.len()).sum::<usize>();
        for post in [&self.label_post, &self.label_key_post, &self.anno_post, &self.anno_key_post] {
            b += post.iter().map(|(k, v)| k.len() + v.len() * slot).sum::<usize>();
        }
        b
    }

    pub fn search(&self, query: &str, limit: usize) -> SearchResponse {
        let started = std::time::Instant::now();
        let q = Query::parse(query);
        let free_q = q.free.join(" ");
        let mut dbg = SearchDebugInfo { docs: self.len(), ..Default::default() };

        let mut candidates: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let k = &self.keys[i];
                q.ns.map(|ns| k.namespace == ns).unwrap_or(true)
                    && (q.groups.is_empty() || q.groups.iter().any(|g| g.eq_ignore_ascii_case(&k.group)))
                    && (q.resources.is_empty() || q.resources.iter().any(|r| r.eq_ignore_ascii_case(&k.resource)))
                    && (q.kinds.is_empty() || q.kinds.iter().any(|kind| kind.eq_ignore_ascii_case(&self.kinds[i])))
            })
            .collect();
        dbg.after_scope = candidates.len();

        narrow(&mut candidates, &self.label_key_post, q.label_keys.as_slice());
        dbg.after_label_keys = candidates.len();
        narrow(&mut candidates, &self.label_post, q.labels.as_slice());
        dbg.after_labels = candidates.len();
        narrow(&mut candidates, &self.anno_key_post, q.anno_keys.as_slice());
        dbg.after_anno_keys = candidates.len();
        narrow(&mut candidates, &self.anno_post, q.annos.as_slice());
        dbg.after_annos = candidates.len();
        metrics::histogram!("search_candidates", candidates.len() as f64);

        let mut scored: Vec<(usize, f32)> = if free_q.is_empty() {
            candidates.into_iter().map(|i| (i, 0.0f32)).collect()
        } else {
            let matcher = SkimMatcherV2::default();
            candidates
                .into_iter()
                .filter_map(|i| matcher.fuzzy_match(&self.texts[i], &free_q).map(|s| (i, s as f32)))
                .collect()
        };
        dbg.matched = scored.len();

        // Score descending, then key ascending (document order).
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let total = scored.len();
        scored.truncate(limit);
        let hits = scored
            .into_iter()
            .map(|(i, score)| SearchHit { key: self.keys[i].clone(), version: self.versions[i], score, created: self.created[i] })
            .collect();
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        SearchResponse { hits, total, debug: dbg }
    }
}
