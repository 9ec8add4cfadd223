use dashmap::DashMap;
use http::Method;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Settings;

/// request parameters, kept sorted so cache keys and equality are order independent
pub type Params = BTreeMap<String, String>;

/// a response cached for one client. immutable once built.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    content: String,
    content_type: String,
    created_at: Instant,
    is_dynamic: bool,
    method: Method,
    parameters: Params,
}

impl CacheEntry {
    pub fn new(
        content: String,
        content_type: String,
        is_dynamic: bool,
        method: Method,
        parameters: Params,
    ) -> Self {
        Self {
            content,
            content_type,
            created_at: Instant::now(),
            is_dynamic,
            method,
            parameters,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[cfg(test)]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// expired once strictly more than `ttl` has elapsed since creation
    pub fn is_expired_at(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    pub fn is_expired(&self, settings: &Settings) -> bool {
        self.is_expired_at(Instant::now(), settings.ttl_for(self.is_dynamic))
    }

    /// milliseconds left before expiry, negative once expired
    pub fn remaining_ms(&self, now: Instant, ttl: Duration) -> i128 {
        ttl.as_millis() as i128 - now.saturating_duration_since(self.created_at).as_millis() as i128
    }

    /// dynamic entries only answer the exact same method and parameters,
    /// static entries answer anything that maps to their key
    pub fn matches(&self, method: &Method, params: &Params) -> bool {
        if self.is_dynamic {
            self.method == *method && self.parameters == *params
        } else {
            true
        }
    }
}

/// builds the canonical cache key: `path` or `path?k1=v1&k2=v2` sorted by key
pub fn cache_key(path: &str, params: &Params) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", path, query)
}

/// one row of a cache listing
#[derive(Debug, Clone)]
pub struct CacheListing {
    pub client_id: String,
    pub key: String,
    pub entry: Arc<CacheEntry>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub entries: usize,
    pub buckets: usize,
}

/// per-client response cache: client identity -> cache key -> entry.
///
/// both levels are sharded maps, so handlers on different clients never
/// contend and no call holds a lock beyond a single map access.
#[derive(Debug, Default)]
pub struct CacheStore {
    buckets: DashMap<String, DashMap<String, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// makes sure a bucket exists for the client. an empty bucket lives until the next sweep.
    pub fn ensure_bucket(&self, client_id: &str) {
        if !self.buckets.contains_key(client_id) {
            self.buckets.entry(client_id.to_string()).or_default();
        }
    }

    pub fn get(&self, client_id: &str, key: &str) -> Option<Arc<CacheEntry>> {
        let bucket = self.buckets.get(client_id)?;
        let entry = bucket.get(key)?;
        Some(Arc::clone(entry.value()))
    }

    /// inserts or overwrites, last writer wins
    pub fn insert(&self, client_id: &str, key: String, entry: CacheEntry) {
        self.buckets
            .entry(client_id.to_string())
            .or_default()
            .insert(key, Arc::new(entry));
    }

    /// removes one entry and drops the bucket if that emptied it
    pub fn remove(&self, client_id: &str, key: &str) -> bool {
        let removed = match self.buckets.get(client_id) {
            Some(bucket) => bucket.remove(key).is_some(),
            None => return false,
        };
        // the bucket ref above must be released before touching the outer map
        self.buckets.remove_if(client_id, |_, bucket| bucket.is_empty());
        removed
    }

    /// snapshot of every entry. rows may be removed right after, but each
    /// row is a complete entry.
    pub fn list_all(&self) -> Vec<CacheListing> {
        let mut rows = Vec::new();
        for bucket in self.buckets.iter() {
            for entry in bucket.value().iter() {
                rows.push(CacheListing {
                    client_id: bucket.key().clone(),
                    key: entry.key().clone(),
                    entry: Arc::clone(entry.value()),
                });
            }
        }
        rows
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// total entry count across all clients
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// drops expired entries from every bucket, then every bucket left empty
    pub fn purge_expired(&self, settings: &Settings, now: Instant) -> PurgeReport {
        let dynamic_ttl = settings.dynamic_ttl();
        let static_ttl = settings.static_ttl();
        let mut report = PurgeReport::default();

        for bucket in self.buckets.iter() {
            let before = bucket.len();
            bucket.retain(|_, entry| {
                let ttl = if entry.is_dynamic() { dynamic_ttl } else { static_ttl };
                !entry.is_expired_at(now, ttl)
            });
            report.entries += before.saturating_sub(bucket.len());
        }

        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        report.buckets = before.saturating_sub(self.buckets.len());
        report
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
