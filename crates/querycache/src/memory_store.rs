use crate::cache_key::CacheKey;
use crate::invalidation::{TagInvalidationNotifier, TagToken, VersionedTagNotifier};
use crate::policy::CachePolicy;
use crate::store::{CacheEntry, CacheStats, CacheStore, CachedData};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use querycache_core::{CacheTag, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct StoredEntry {
    entry: CacheEntry<CachedData>,
    tokens: Vec<TagToken>,
}

impl StoredEntry {
    fn is_live(&self) -> bool {
        !self.entry.is_expired() && self.tokens.iter().all(TagToken::is_valid)
    }
}

/// Process-local reference backend.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    entries: Arc<DashMap<CacheKey, StoredEntry>>,
    /// LRU tracking for eviction
    lru_queue: Arc<Mutex<VecDeque<CacheKey>>>,
    notifier: Arc<dyn TagInvalidationNotifier>,
    stats: Arc<Mutex<CacheStats>>,
    max_entries: usize,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl InMemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self::with_notifier(max_entries, Arc::new(VersionedTagNotifier::new()))
    }

    pub fn with_notifier(max_entries: usize, notifier: Arc<dyn TagInvalidationNotifier>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            lru_queue: Arc::new(Mutex::new(VecDeque::new())),
            notifier,
            stats: Arc::new(Mutex::new(CacheStats::default())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.entries = self.entries.len();
        stats
    }

    /// Drop expired and invalidated entries; returns how many went.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live());
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            let entries = &self.entries;
            self.lru_queue.lock().retain(|key| entries.contains_key(key));
            self.stats.lock().evictions += removed as u64;
            debug!("Cleaned up {} stale cache entries", removed);
        }
        removed
    }

    fn touch_lru(&self, key: &CacheKey) {
        let mut lru_queue = self.lru_queue.lock();
        lru_queue.retain(|k| k != key);
        lru_queue.push_back(key.clone());
    }

    fn evict_lru(&self) {
        let mut lru_queue = self.lru_queue.lock();
        while self.entries.len() > self.max_entries {
            let Some(oldest) = lru_queue.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.stats.lock().evictions += 1;
                debug!("Evicted least recently used entry {}", oldest);
            }
        }
    }

    fn forget(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.lru_queue.lock().retain(|k| k != key);
        }
        removed
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &CacheKey, _policy: &CachePolicy) -> Result<Option<CachedData>> {
        let hit = match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live() => {
                stored.entry.touch();
                Some(stored.entry.value.clone())
            }
            // stale, removed once the guard is gone
            Some(_) => None,
            None => {
                self.stats.lock().misses += 1;
                return Ok(None);
            }
        };

        match hit {
            Some(value) => {
                self.touch_lru(key);
                self.stats.lock().hits += 1;
                Ok(Some(value))
            }
            None => {
                if self.forget(key) {
                    self.stats.lock().evictions += 1;
                }
                self.stats.lock().misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: CachedData, policy: &CachePolicy) -> Result<()> {
        let tokens = key
            .dependency_tags()
            .iter()
            .map(|tag| self.notifier.get_or_create(tag))
            .collect();

        self.entries.insert(
            key.clone(),
            StoredEntry {
                entry: CacheEntry::new(value, policy),
                tokens,
            },
        );
        self.touch_lru(key);
        self.stats.lock().insertions += 1;
        self.evict_lru();
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.forget(key);
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &CacheTag) -> Result<()> {
        self.notifier.invalidate(tag);

        let before = self.entries.len();
        self.entries
            .retain(|_, stored| stored.tokens.iter().all(TagToken::is_valid));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            let entries = &self.entries;
            self.lru_queue.lock().retain(|key| entries.contains_key(key));
            self.stats.lock().invalidations += removed as u64;
        }
        debug!("Tag {} invalidated {} entries", tag, removed);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.notifier.invalidate_all();
        self.entries.clear();
        self.lru_queue.lock().clear();
        Ok(())
    }
}
