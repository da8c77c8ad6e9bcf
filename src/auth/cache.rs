//! Bounded LRU cache of authentications with idle and live expiry.
//!
//! Entries are keyed by filter name and a per-filter cache key. Lookups run
//! under the read lock; inserts, removals and evictions take the write lock.
//! A recency index ordered by access sequence makes each eviction O(log n).

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::Authentication;
use crate::config::schema::AuthCacheConfig;
use crate::observability::metrics;

/// Default bounds. A zero idle or live time disables that bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub time_to_idle: Duration,
    pub time_to_live: Duration,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            time_to_idle: Duration::from_secs(300),
            time_to_live: Duration::from_secs(600),
            max_entries: 1000,
        }
    }
}

impl From<&AuthCacheConfig> for CacheSettings {
    fn from(config: &AuthCacheConfig) -> Self {
        Self {
            time_to_idle: Duration::from_secs(config.time_to_idle_secs),
            time_to_live: Duration::from_secs(config.time_to_live_secs),
            max_entries: config.max_entries,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    authentication: Authentication,
    time_to_idle: Duration,
    time_to_live: Duration,
    created: Instant,
    /// Nanoseconds since the cache epoch.
    last_accessed: AtomicU64,
    /// Global access sequence, for LRU ordering.
    last_touch: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, epoch: Instant) -> bool {
        let accessed = epoch + Duration::from_nanos(self.last_accessed.load(Ordering::Relaxed));
        let idle_expired =
            !self.time_to_idle.is_zero() && now.saturating_duration_since(accessed) > self.time_to_idle;
        let live_expired =
            !self.time_to_live.is_zero() && now.saturating_duration_since(self.created) > self.time_to_live;
        idle_expired || live_expired
    }
}

/// Counters exposed through the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// One cached authentication, as listed by the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CachedEntry {
    pub key: String,
    pub principal: String,
}

/// Recency index: access sequence -> (filter, key). Holds exactly one
/// element per cached entry, keyed by that entry's `last_touch`.
type Recency = BTreeMap<u64, (String, String)>;

/// Shared authentication cache.
#[derive(Debug)]
pub struct AuthenticationCache {
    settings: CacheSettings,
    epoch: Instant,
    /// filter name -> cache key -> entry
    entries: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    /// Locked after `entries`, never before.
    recency: Mutex<Recency>,
    touch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl AuthenticationCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
            recency: Mutex::new(BTreeMap::new()),
            touch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    fn offset(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn next_touch(&self) -> u64 {
        self.touch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Mark an entry as most recently used.
    fn touch_entry(&self, entry: &CacheEntry, now: Instant) {
        entry.last_accessed.store(self.offset(now), Ordering::Relaxed);
        let mut recency = self.recency.lock();
        let touch = self.next_touch();
        let previous = entry.last_touch.swap(touch, Ordering::Relaxed);
        if let Some(id) = recency.remove(&previous) {
            recency.insert(touch, id);
        }
    }

    /// Look up an authentication, refreshing its idle time.
    pub fn get(&self, filter: &str, key: &str) -> Option<Authentication> {
        self.get_at(filter, key, Instant::now())
    }

    pub(crate) fn get_at(&self, filter: &str, key: &str, now: Instant) -> Option<Authentication> {
        {
            let entries = self.entries.read();
            match entries.get(filter).and_then(|m| m.get(key)) {
                None => {
                    self.record_lookup(false);
                    return None;
                }
                Some(entry) if !entry.is_expired(now, self.epoch) => {
                    self.touch_entry(entry, now);
                    self.record_lookup(true);
                    return Some(entry.authentication.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, another thread may have
        // replaced the entry in between.
        let mut entries = self.entries.write();
        if let Some(filter_entries) = entries.get_mut(filter) {
            let still_expired = filter_entries
                .get(key)
                .map(|e| e.is_expired(now, self.epoch))
                .unwrap_or(false);
            if still_expired {
                if let Some(entry) = filter_entries.remove(key) {
                    self.recency.lock().remove(&entry.last_touch.load(Ordering::Relaxed));
                }
                self.expirations.fetch_add(1, Ordering::Relaxed);
                if filter_entries.is_empty() {
                    entries.remove(filter);
                }
            } else if let Some(entry) = filter_entries.get(key) {
                self.touch_entry(entry, now);
                self.record_lookup(true);
                return Some(entry.authentication.clone());
            }
        }
        self.record_lookup(false);
        None
    }

    /// Cache with the default idle and live times.
    pub fn put(&self, filter: &str, key: &str, authentication: Authentication) {
        self.put_with(
            filter,
            key,
            authentication,
            self.settings.time_to_idle,
            self.settings.time_to_live,
        );
    }

    pub fn put_with(
        &self,
        filter: &str,
        key: &str,
        authentication: Authentication,
        time_to_idle: Duration,
        time_to_live: Duration,
    ) {
        self.put_at(filter, key, authentication, time_to_idle, time_to_live, Instant::now());
    }

    pub(crate) fn put_at(
        &self,
        filter: &str,
        key: &str,
        authentication: Authentication,
        time_to_idle: Duration,
        time_to_live: Duration,
        now: Instant,
    ) {
        if self.settings.max_entries == 0 {
            return;
        }

        let mut entries = self.entries.write();
        let mut recency = self.recency.lock();
        let touch = self.next_touch();
        let entry = CacheEntry {
            authentication,
            time_to_idle,
            time_to_live,
            created: now,
            last_accessed: AtomicU64::new(self.offset(now)),
            last_touch: AtomicU64::new(touch),
        };

        let replaced = entries
            .entry(filter.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        if let Some(old) = replaced {
            recency.remove(&old.last_touch.load(Ordering::Relaxed));
        }
        recency.insert(touch, (filter.to_string(), key.to_string()));

        while recency.len() > self.settings.max_entries {
            let Some((_, (victim_filter, victim_key))) = recency.pop_first() else {
                break;
            };
            tracing::trace!(filter = %victim_filter, "Evicting least recently used authentication");
            if let Some(m) = entries.get_mut(&victim_filter) {
                m.remove(&victim_key);
                if m.is_empty() {
                    entries.remove(&victim_filter);
                }
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_auth_cache_size(recency.len());
    }

    pub fn remove(&self, filter: &str, key: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(m) = entries.get_mut(filter) else {
            return false;
        };
        let removed = m.remove(key);
        if m.is_empty() {
            entries.remove(filter);
        }
        let mut recency = self.recency.lock();
        if let Some(entry) = &removed {
            recency.remove(&entry.last_touch.load(Ordering::Relaxed));
        }
        metrics::record_auth_cache_size(recency.len());
        removed.is_some()
    }

    /// Remove every entry cached by one filter. Returns how many were removed.
    pub fn remove_all_for(&self, filter: &str) -> usize {
        let mut entries = self.entries.write();
        let Some(m) = entries.remove(filter) else {
            return 0;
        };
        let mut recency = self.recency.lock();
        for entry in m.values() {
            recency.remove(&entry.last_touch.load(Ordering::Relaxed));
        }
        metrics::record_auth_cache_size(recency.len());
        tracing::debug!(filter = %filter, removed = m.len(), "Authentication cache flushed for filter");
        m.len()
    }

    pub fn remove_all(&self) -> usize {
        let mut entries = self.entries.write();
        let mut recency = self.recency.lock();
        let removed = recency.len();
        entries.clear();
        recency.clear();
        tracing::debug!(removed, "Authentication cache flushed");
        metrics::record_auth_cache_size(0);
        removed
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let mut recency = self.recency.lock();
        let mut removed = 0;
        entries.retain(|_, m| {
            m.retain(|_, e| {
                let expired = e.is_expired(now, self.epoch);
                if expired {
                    recency.remove(&e.last_touch.load(Ordering::Relaxed));
                    removed += 1;
                }
                !expired
            });
            !m.is_empty()
        });
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        metrics::record_auth_cache_size(recency.len());
        removed
    }

    pub fn len(&self) -> usize {
        let _entries = self.entries.read();
        self.recency.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache keys currently held for a filter.
    pub fn keys_for(&self, filter: &str) -> Vec<String> {
        self.entries_for(filter).into_iter().map(|e| e.key).collect()
    }

    /// Entries currently held for a filter, ordered by key.
    pub fn entries_for(&self, filter: &str) -> Vec<CachedEntry> {
        let mut listed: Vec<CachedEntry> = self
            .entries
            .read()
            .get(filter)
            .map(|m| {
                m.iter()
                    .map(|(key, e)| CachedEntry {
                        key: key.clone(),
                        principal: e.authentication.principal.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        listed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            max_entries: self.settings.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_auth_cache_lookup(hit);
    }

    /// Sweep expired entries every `interval` until shutdown or until the
    /// cache is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.evict_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired authentications");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(name: &str) -> Authentication {
        Authentication::new(name, vec!["ROLE_USER".into()], "basic")
    }

    fn cache(max: usize) -> AuthenticationCache {
        AuthenticationCache::new(CacheSettings {
            time_to_idle: Duration::from_secs(300),
            time_to_live: Duration::from_secs(600),
            max_entries: max,
        })
    }

    #[test]
    fn put_get_and_remove() {
        let cache = cache(10);
        assert!(cache.get("basic", "k1").is_none());

        cache.put("basic", "k1", auth("alice"));
        cache.put("token", "k1", auth("bob"));
        assert_eq!(cache.get("basic", "k1").unwrap().principal, "alice");
        assert_eq!(cache.get("token", "k1").unwrap().principal, "bob");
        assert_eq!(cache.len(), 2);

        assert!(cache.remove("basic", "k1"));
        assert!(!cache.remove("basic", "k1"));
        assert!(cache.get("basic", "k1").is_none());
        assert_eq!(cache.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn remove_all_for_filter_keeps_other_filters() {
        let cache = cache(10);
        cache.put("basic", "a", auth("a"));
        cache.put("basic", "b", auth("b"));
        cache.put("header", "c", auth("c"));

        assert_eq!(cache.remove_all_for("basic"), 2);
        assert!(cache.keys_for("basic").is_empty());
        assert_eq!(cache.keys_for("header"), vec!["c".to_string()]);

        assert_eq!(cache.remove_all(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = cache(2);
        let t0 = Instant::now();
        cache.put_at("basic", "a", auth("a"), Duration::ZERO, Duration::ZERO, t0);
        cache.put_at("basic", "b", auth("b"), Duration::ZERO, Duration::ZERO, t0);

        // Touch "a" so "b" becomes the eldest.
        assert!(cache.get_at("basic", "a", t0).is_some());
        cache.put_at("basic", "c", auth("c"), Duration::ZERO, Duration::ZERO, t0);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("basic", "b", t0).is_none());
        assert!(cache.get_at("basic", "a", t0).is_some());
        assert!(cache.get_at("basic", "c", t0).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn eviction_follows_access_order_across_filters() {
        let cache = cache(3);
        let t0 = Instant::now();
        for (filter, key) in [("basic", "a"), ("token", "b"), ("basic", "c")] {
            cache.put_at(filter, key, auth(key), Duration::ZERO, Duration::ZERO, t0);
        }
        // Access order is now b, c, a.
        assert!(cache.get_at("basic", "a", t0).is_some());
        // Replacing "b" makes it the newest again, leaving "c" eldest.
        cache.put_at("token", "b", auth("b2"), Duration::ZERO, Duration::ZERO, t0);

        cache.put_at("header", "d", auth("d"), Duration::ZERO, Duration::ZERO, t0);
        assert!(cache.get_at("basic", "c", t0).is_none());
        cache.put_at("header", "e", auth("e"), Duration::ZERO, Duration::ZERO, t0);
        assert!(cache.get_at("basic", "a", t0).is_none());

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 2);
        assert_eq!(cache.get_at("token", "b", t0).unwrap().principal, "b2");
    }

    #[test]
    fn removals_keep_the_recency_index_in_step() {
        let cache = cache(2);
        cache.put("basic", "a", auth("a"));
        cache.put("basic", "b", auth("b"));
        assert!(cache.remove("basic", "a"));
        assert_eq!(cache.remove_all_for("basic"), 1);
        assert!(cache.is_empty());

        // A stale index entry would evict one of these early.
        cache.put("basic", "c", auth("c"));
        cache.put("token", "d", auth("d"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn lists_entries_with_principals() {
        let cache = cache(10);
        cache.put("basic", "k2", auth("bob"));
        cache.put("basic", "k1", auth("alice"));
        assert_eq!(
            cache.entries_for("basic"),
            vec![
                CachedEntry { key: "k1".into(), principal: "alice".into() },
                CachedEntry { key: "k2".into(), principal: "bob".into() },
            ]
        );
    }

    #[test]
    fn idle_expiry_is_refreshed_by_access() {
        let cache = cache(10);
        let t0 = Instant::now();
        let idle = Duration::from_secs(10);
        cache.put_at("basic", "a", auth("a"), idle, Duration::ZERO, t0);

        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(8)).is_some());
        // 16s after creation but only 8s after last access.
        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(16)).is_some());
        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(27)).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn live_expiry_ignores_access() {
        let cache = cache(10);
        let t0 = Instant::now();
        let live = Duration::from_secs(10);
        cache.put_at("basic", "a", auth("a"), Duration::from_secs(5), live, t0);

        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(4)).is_some());
        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(8)).is_some());
        assert!(cache.get_at("basic", "a", t0 + Duration::from_secs(11)).is_none());
    }

    #[test]
    fn replacing_an_entry_resets_creation() {
        let cache = cache(10);
        let t0 = Instant::now();
        let live = Duration::from_secs(10);
        cache.put_at("basic", "a", auth("old"), Duration::ZERO, live, t0);
        cache.put_at("basic", "a", auth("new"), Duration::ZERO, live, t0 + Duration::from_secs(8));

        let got = cache.get_at("basic", "a", t0 + Duration::from_secs(15)).unwrap();
        assert_eq!(got.principal, "new");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = cache(10);
        let t0 = Instant::now();
        cache.put_at("basic", "short", auth("a"), Duration::from_secs(1), Duration::ZERO, t0);
        cache.put_at("basic", "long", auth("b"), Duration::from_secs(100), Duration::ZERO, t0);
        cache.put_at("token", "short", auth("c"), Duration::ZERO, Duration::from_secs(1), t0);

        assert_eq!(cache.evict_expired_at(t0 + Duration::from_secs(5)), 2);
        assert_eq!(cache.keys_for("basic"), vec!["long".to_string()]);
        assert!(cache.keys_for("token").is_empty());
    }

    #[test]
    fn concurrent_access_respects_bound() {
        let cache = Arc::new(cache(50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("{}-{}", t, i);
                        cache.put("basic", &key, auth(&key));
                        cache.get("basic", &key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 50);
    }
}
