//! Result cache keyed by normalized URL.
//!
//! Backed by [`moka::future::Cache`]. Every entry carries its own TTL; expiry
//! is checked on read and moka additionally sweeps expired entries in the
//! background. Cache operations never fail: a disabled cache is simply a
//! cache that always misses.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::models::{ExtractionResult, normalize_url};

/// A cached extraction and its lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: ExtractionResult,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used by [`RecipeCache::insert`].
    pub default_ttl: Duration,
    /// Upper bound on stored entries.
    pub max_entries: u64,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            max_entries: 10_000,
            enabled: true,
        }
    }
}

/// Shared, clone-cheap result cache.
#[derive(Clone)]
pub struct RecipeCache {
    inner: Cache<String, CacheEntry>,
    default_ttl: Duration,
    enabled: bool,
}

impl RecipeCache {
    pub fn new(config: CacheConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(EntryTtl)
            .build();
        Self {
            inner,
            default_ttl: config.default_ttl,
            enabled: config.enabled,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a URL. Stale entries are evicted and reported as a miss.
    pub async fn get(&self, url: &str) -> Option<ExtractionResult> {
        if !self.enabled {
            return None;
        }
        let key = normalize_url(url);
        let entry = self.inner.get(&key).await?;
        if entry.is_expired() {
            tracing::debug!(%key, "Evicting stale cache entry");
            self.inner.invalidate(&key).await;
            return None;
        }
        Some(entry.value)
    }

    /// Store a result, replacing any previous entry for the same key.
    pub async fn set(&self, url: &str, result: ExtractionResult, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let key = normalize_url(url);
        let entry = CacheEntry {
            key: key.clone(),
            value: result,
            created_at: Instant::now(),
            ttl,
        };
        self.inner.insert(key, entry).await;
    }

    /// Store a result with the configured default TTL.
    pub async fn insert(&self, url: &str, result: ExtractionResult) {
        self.set(url, result, self.default_ttl).await;
    }

    pub async fn invalidate(&self, url: &str) {
        self.inner.invalidate(&normalize_url(url)).await;
    }

    /// Number of live entries, after flushing moka's pending maintenance.
    pub async fn len(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for RecipeCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
