//! Watch fan-out: one mutation stream, many filtered subscribers.
//!
//! Publishing never blocks. Each subscriber owns a bounded queue; a subscriber
//! whose queue is full is evicted and later observes `SlowConsumer`. Dropping a
//! [`Subscription`] releases its slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use futures::Stream;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};
use unistore_core::{KeyPattern, ResourceError, ResourceResult, Version, WatchEvent};

/// Why a subscription ended, set at most once by the broadcaster.
type Fault = Arc<OnceLock<ResourceError>>;

struct Slot {
    pattern: KeyPattern,
    tx: mpsc::Sender<WatchEvent>,
    fault: Fault,
}

struct Inner {
    subs: RwLock<FxHashMap<u64, Slot>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Inner {
    fn remove(&self, id: u64) -> bool {
        let mut subs = self.subs.write().unwrap_or_else(PoisonError::into_inner);
        let removed = subs.remove(&id).is_some();
        gauge!("watch_subscribers", subs.len() as f64);
        removed
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// `capacity` bounds each subscriber's delivery queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn subscribe(&self, pattern: KeyPattern) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let fault: Fault = Arc::new(OnceLock::new());
        {
            let mut subs = self.inner.subs.write().unwrap_or_else(PoisonError::into_inner);
            subs.insert(id, Slot { pattern: pattern.clone(), tx, fault: Arc::clone(&fault) });
            gauge!("watch_subscribers", subs.len() as f64);
        }
        debug!(id, pattern = %pattern, "watch: subscriber registered");
        Subscription {
            id,
            pattern,
            rx,
            fault,
            replay: VecDeque::new(),
            watermark: 0,
            done: false,
            _registration: Registration { id, inner: Arc::downgrade(&self.inner) },
        }
    }

    /// Offer an event to every matching subscriber without waiting.
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&self, event: &WatchEvent) -> usize {
        let mut delivered = 0usize;
        let mut evict: Vec<u64> = Vec::new();
        {
            let subs = self.inner.subs.read().unwrap_or_else(PoisonError::into_inner);
            for (id, slot) in subs.iter() {
                if !slot.pattern.matches(&event.key) {
                    continue;
                }
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        let _ = slot.fault.set(ResourceError::SlowConsumer(*id));
                        counter!("watch_slow_consumer_total", 1u64);
                        warn!(id = *id, key = %event.key, capacity = self.inner.capacity, "watch: queue full; disconnecting slow subscriber");
                        evict.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!(id = *id, "watch: receiver gone; releasing slot");
                        evict.push(*id);
                    }
                }
            }
        }
        for id in evict {
            self.inner.remove(id);
        }
        counter!("watch_events_sent_total", delivered as u64);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Disconnect everyone; open subscriptions end with `Closed`.
    pub fn close(&self, reason: &str) {
        let mut subs = self.inner.subs.write().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in subs.drain() {
            let _ = slot.fault.set(ResourceError::Closed(reason.to_string()));
        }
        gauge!("watch_subscribers", 0.0);
    }
}

/// Unregisters the slot when the subscription goes away.
struct Registration {
    id: u64,
    inner: Weak<Inner>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.remove(self.id) {
                trace!(id = self.id, "watch: subscriber unregistered");
            }
        }
    }
}

/// Receiving side of a watch. Events for one key arrive in version order.
pub struct Subscription {
    id: u64,
    pattern: KeyPattern,
    rx: mpsc::Receiver<WatchEvent>,
    fault: Fault,
    replay: VecDeque<WatchEvent>,
    /// Live events at or below this version were already replayed.
    watermark: Version,
    done: bool,
    _registration: Registration,
}

impl Subscription {
    pub fn id(&self) -> u64 { self.id }

    pub fn pattern(&self) -> &KeyPattern { &self.pattern }

    /// Queue historical events ahead of live ones. Live events with a version
    /// at or below the newest replayed (or `since`) are skipped.
    pub fn prime(&mut self, replay: Vec<WatchEvent>, since: Version) {
        let last = replay.last().map(|e| e.version()).unwrap_or(since);
        self.watermark = last.max(since);
        self.replay.extend(replay);
    }

    /// Next event, `Some(Err(..))` once if the broadcaster ended the
    /// subscription, then `None`.
    pub async fn recv(&mut self) -> Option<ResourceResult<WatchEvent>> {
        if let Some(ev) = self.replay.pop_front() {
            return Some(Ok(ev));
        }
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(ev) if ev.version() <= self.watermark => continue,
                Some(ev) => return Some(Ok(ev)),
                None => {
                    self.done = true;
                    return self.fault.get().cloned().map(Err);
                }
            }
        }
    }

    /// Explicit unsubscribe; same as dropping.
    pub fn cancel(self) {}

    pub fn into_stream(self) -> impl Stream<Item = ResourceResult<WatchEvent>> + Send {
        futures::stream::unfold(self, |mut sub| async move { sub.recv().await.map(|item| (item, sub)) })
    }
}
