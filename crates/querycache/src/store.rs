use crate::cache_key::CacheKey;
use crate::policy::CachePolicy;
use crate::snapshot::ResultSnapshot;
use async_trait::async_trait;
use querycache_core::{CacheTag, DbValue, ExpirationMode, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Key used by the default availability probe.
pub const PROBE_KEY: &str = "__querycache_probe__";

/// What a store keeps for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedData {
    /// A captured tabular result.
    Rows(ResultSnapshot),
    /// Affected-row count of a non-query command.
    NonQuery(i64),
    /// A scalar result.
    Scalar(DbValue),
    /// The command produced no result at all; cached so the miss is not repeated.
    Null,
}

impl CachedData {
    pub fn is_null(&self) -> bool {
        matches!(self, CachedData::Null | CachedData::Scalar(DbValue::Null))
    }

    /// Rows for tabular results, 0 for the rest.
    pub fn row_count(&self) -> usize {
        match self {
            CachedData::Rows(snapshot) => snapshot.row_count(),
            _ => 0,
        }
    }

    /// Self-describing byte form for stores that keep opaque blobs.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Storage-provider contract for cache backends.
///
/// Dependency tags on the key are a multi-valued secondary index: an entry set
/// under N tags must be dropped by an invalidation of any one of them.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey, policy: &CachePolicy) -> Result<Option<CachedData>>;

    async fn set(&self, key: &CacheKey, value: CachedData, policy: &CachePolicy) -> Result<()>;

    async fn remove(&self, key: &CacheKey) -> Result<()>;

    async fn invalidate_tag(&self, tag: &CacheTag) -> Result<()>;

    async fn invalidate_tags(&self, tags: &BTreeSet<CacheTag>) -> Result<()> {
        for tag in tags {
            self.invalidate_tag(tag).await?;
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()>;

    /// Cheap round trip used to decide whether the store is up.
    async fn probe(&self) -> Result<()> {
        self.get(&CacheKey::new(PROBE_KEY, ""), &CachePolicy::never_remove())
            .await
            .map(|_| ())
    }
}

/// Cache entry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub expiration_mode: ExpirationMode,
    pub timeout: Option<Duration>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, policy: &CachePolicy) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            expiration_mode: policy.expiration_mode(),
            timeout: policy.timeout(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        match self.expiration_mode {
            ExpirationMode::Absolute => now.duration_since(self.created_at) > timeout,
            ExpirationMode::Sliding => now.duration_since(self.last_accessed) > timeout,
            ExpirationMode::NeverRemove => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_expiry_ignores_reads() {
        let policy = CachePolicy::absolute(Duration::from_secs(10)).unwrap();
        let mut entry = CacheEntry::new(1, &policy);
        let start = entry.created_at;
        entry.last_accessed = start + Duration::from_secs(9);
        assert!(!entry.is_expired_at(start + Duration::from_secs(10)));
        assert!(entry.is_expired_at(start + Duration::from_secs(11)));
    }

    #[test]
    fn test_sliding_expiry_follows_last_access() {
        let policy = CachePolicy::sliding(Duration::from_secs(10)).unwrap();
        let mut entry = CacheEntry::new(1, &policy);
        let start = entry.created_at;
        entry.last_accessed = start + Duration::from_secs(9);
        assert!(!entry.is_expired_at(start + Duration::from_secs(15)));
        assert!(entry.is_expired_at(start + Duration::from_secs(20)));
    }

    #[test]
    fn test_never_remove_does_not_expire() {
        let entry = CacheEntry::new(1, &CachePolicy::never_remove());
        assert!(!entry.is_expired_at(entry.created_at + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_cached_data_bytes_keep_null() {
        for data in [
            CachedData::Null,
            CachedData::Scalar(DbValue::Null),
            CachedData::NonQuery(3),
        ] {
            let bytes = data.to_bytes().unwrap();
            assert_eq!(CachedData::from_bytes(&bytes).unwrap(), data);
        }
        assert!(CachedData::Scalar(DbValue::Null).is_null());
        assert!(!CachedData::NonQuery(0).is_null());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
    }
}
