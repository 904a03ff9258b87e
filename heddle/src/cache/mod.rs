//! Content-addressed response cache: TTL-expiring, size-bounded, concurrency-safe.
//!
//! Entries live in a concurrent map keyed by the request fingerprint; a single
//! mutex serializes size accounting so the entry count never exceeds
//! `max_size` once a `set` has returned. Expiry and cleanup delete an entry
//! only when its timestamp still matches the one they observed, so a
//! concurrently refreshed entry is never lost to a stale check. Entries are
//! never mutated in place; a refresh is a new entry with a new timestamp.

mod fingerprint;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use fingerprint::{canonicalize, fingerprint};

/// How many times `set` retries eviction when a concurrent get/cleanup beats
/// it to the oldest entry.
const EVICT_RETRIES: usize = 3;

#[derive(Clone)]
struct CacheEntry {
    body: Arc<String>,
    created_at: Instant,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    /// Max entries; 0 = unbounded.
    max_size: usize,
    /// Entry lifetime; zero = never expire.
    ttl: Duration,
    /// Serializes size accounting in `set`; never held across I/O.
    evict_lock: Mutex<()>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            ttl,
            evict_lock: Mutex::new(()),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn expired(&self, created_at: Instant) -> bool {
        !self.ttl.is_zero() && created_at.elapsed() > self.ttl
    }

    /// Looks up the cached response for (model, messages). An expired entry is
    /// deleted on the way out, unless a concurrent `set` refreshed it after
    /// our read, in which case the fresh entry is preserved.
    pub fn get(&self, model: &str, messages: &Value) -> Option<Arc<String>> {
        self.get_by_key(&fingerprint(model, messages))
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<String>> {
        let (body, created_at) = {
            let entry = self.entries.get(key)?;
            (Arc::clone(&entry.body), entry.created_at)
        };
        if self.expired(created_at) {
            self.entries
                .remove_if(key, |_, e| e.created_at == created_at);
            return None;
        }
        Some(body)
    }

    /// Stores a response. An existing key is overwritten (no size change).
    /// Otherwise, at the cap, the oldest entry is evicted first (retried up
    /// to three times if concurrent removals race us); if the map is
    /// somehow still full the insert is declined. Returns whether the value
    /// was stored.
    pub fn set(&self, model: &str, messages: &Value, body: String) -> bool {
        self.set_by_key(fingerprint(model, messages), body)
    }

    fn set_by_key(&self, key: String, body: String) -> bool {
        let entry = CacheEntry {
            body: Arc::new(body),
            created_at: Instant::now(),
        };
        let _accounting = self.evict_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.entries.contains_key(&key) {
            self.entries.insert(key, entry);
            return true;
        }
        if self.max_size > 0 {
            for _ in 0..EVICT_RETRIES {
                if self.entries.len() < self.max_size {
                    break;
                }
                let oldest = self
                    .entries
                    .iter()
                    .map(|e| (e.key().clone(), e.value().created_at))
                    .min_by_key(|(_, created_at)| *created_at);
                match oldest {
                    Some((victim, created_at)) => {
                        self.entries
                            .remove_if(&victim, |_, e| e.created_at == created_at);
                    }
                    None => break,
                }
            }
            if self.entries.len() >= self.max_size {
                tracing::debug!("response cache at capacity, declining insert");
                return false;
            }
        }
        self.entries.insert(key, entry);
        true
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Stops the cleanup task. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stops the cleanup task and waits for it to finish.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.tracker.wait().await;
    }

    /// Spawns the background cleanup task, ticking every `ttl / 2`. A zero
    /// TTL means entries never expire and no task is started.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        if self.ttl.is_zero() {
            self.tracker.close();
            return;
        }
        let cache = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut tick = tokio::time::interval(cache.ttl / 2);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cache.stop.cancelled() => break,
                    _ = tick.tick() => {}
                }
                cache.remove_expired();
            }
        });
        self.tracker.close();
    }

    fn remove_expired(&self) {
        let snapshot: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().created_at))
            .collect();
        for (key, created_at) in snapshot {
            if self.expired(created_at) {
                // Same rule as `get`: only delete what we actually observed.
                self.entries
                    .remove_if(&key, |_, e| e.created_at == created_at);
            }
        }
    }
}
