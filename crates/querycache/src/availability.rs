use crate::store::CacheStore;
use parking_lot::Mutex;
use querycache_core::{AvailabilityConfig, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Unknown,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    state: AvailabilityState,
    checked_at: Option<Instant>,
}

/// Caches the "is the store up" verdict for `check_interval`.
#[derive(Debug)]
pub struct AvailabilityGuard {
    enabled: bool,
    check_interval: Duration,
    fail_open: bool,
    verdict: Mutex<Verdict>,
}

impl AvailabilityGuard {
    pub fn new(config: &AvailabilityConfig) -> Self {
        Self {
            enabled: config.enabled,
            check_interval: config.check_interval(),
            fail_open: config.fail_open,
            verdict: Mutex::new(Verdict {
                state: AvailabilityState::Unknown,
                checked_at: None,
            }),
        }
    }

    /// Override the config's whole-second interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Guard that never probes and always reports the store as up.
    pub fn disabled() -> Self {
        Self::new(&AvailabilityConfig {
            enabled: false,
            ..AvailabilityConfig::default()
        })
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn state(&self) -> AvailabilityState {
        self.verdict.lock().state
    }

    /// Record a store fault seen outside a probe. The store is bypassed until
    /// the interval elapses and a probe succeeds again.
    pub fn mark_unavailable(&self) {
        if self.enabled {
            self.record(AvailabilityState::Unavailable);
        }
    }

    pub async fn is_available(&self, store: &dyn CacheStore) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }

        {
            let verdict = self.verdict.lock();
            if let Some(checked_at) = verdict.checked_at {
                if checked_at.elapsed() < self.check_interval {
                    return Ok(verdict.state == AvailabilityState::Available);
                }
            }
        }

        match store.probe().await {
            Ok(()) => {
                let previous = self.record(AvailabilityState::Available);
                if previous == AvailabilityState::Unavailable {
                    info!("Cache store is available again");
                }
                Ok(true)
            }
            Err(e) if self.fail_open => {
                warn!("Cache store probe failed, bypassing cache: {}", e);
                self.record(AvailabilityState::Unavailable);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn record(&self, state: AvailabilityState) -> AvailabilityState {
        let mut verdict = self.verdict.lock();
        let previous = verdict.state;
        *verdict = Verdict {
            state,
            checked_at: Some(Instant::now()),
        };
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheKey;
    use crate::policy::CachePolicy;
    use crate::store::CachedData;
    use async_trait::async_trait;
    use querycache_core::{CacheTag, QueryCacheError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyStore {
        down: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get(&self, _: &CacheKey, _: &CachePolicy) -> Result<Option<CachedData>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(QueryCacheError::StoreUnavailable("connection refused".into()))
            } else {
                Ok(None)
            }
        }
        async fn set(&self, _: &CacheKey, _: CachedData, _: &CachePolicy) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _: &CacheKey) -> Result<()> {
            Ok(())
        }
        async fn invalidate_tag(&self, _: &CacheTag) -> Result<()> {
            Ok(())
        }
        async fn clear_all(&self) -> Result<()> {
            Ok(())
        }
    }

    fn config(fail_open: bool, secs: u64) -> AvailabilityConfig {
        AvailabilityConfig {
            enabled: true,
            check_interval_secs: secs,
            fail_open,
        }
    }

    #[tokio::test]
    async fn test_disabled_guard_never_probes() {
        let store = FlakyStore::default();
        store.down.store(true, Ordering::SeqCst);
        let guard = AvailabilityGuard::disabled();
        assert!(guard.is_available(&store).await.unwrap());
        assert_eq!(store.probes.load(Ordering::SeqCst), 0);
        assert_eq!(guard.state(), AvailabilityState::Unknown);
    }

    #[tokio::test]
    async fn test_verdict_is_cached_within_interval() {
        let store = FlakyStore::default();
        let guard = AvailabilityGuard::new(&config(true, 60));
        assert!(guard.is_available(&store).await.unwrap());
        store.down.store(true, Ordering::SeqCst);
        assert!(guard.is_available(&store).await.unwrap());
        assert_eq!(store.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_open_swallows_probe_error() {
        let store = FlakyStore::default();
        store.down.store(true, Ordering::SeqCst);
        let guard = AvailabilityGuard::new(&config(true, 60));
        assert!(!guard.is_available(&store).await.unwrap());
        assert_eq!(guard.state(), AvailabilityState::Unavailable);
    }

    #[tokio::test]
    async fn test_fail_closed_propagates_probe_error() {
        let store = FlakyStore::default();
        store.down.store(true, Ordering::SeqCst);
        let guard = AvailabilityGuard::new(&config(false, 60));
        let err = guard.is_available(&store).await.unwrap_err();
        assert!(matches!(err, QueryCacheError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_mark_unavailable_holds_for_interval() {
        let store = FlakyStore::default();
        let guard = AvailabilityGuard::new(&config(true, 60));
        assert!(guard.is_available(&store).await.unwrap());
        guard.mark_unavailable();
        assert!(!guard.is_available(&store).await.unwrap());
        assert_eq!(guard.state(), AvailabilityState::Unavailable);
        assert_eq!(store.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_interval() {
        let store = FlakyStore::default();
        store.down.store(true, Ordering::SeqCst);
        let guard = AvailabilityGuard::new(&config(true, 60))
            .with_check_interval(Duration::from_millis(20));
        assert_eq!(guard.check_interval(), Duration::from_millis(20));

        assert!(!guard.is_available(&store).await.unwrap());
        store.down.store(false, Ordering::SeqCst);
        assert!(!guard.is_available(&store).await.unwrap());
        assert_eq!(store.probes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(guard.is_available(&store).await.unwrap());
        assert_eq!(guard.state(), AvailabilityState::Available);
        assert_eq!(store.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_marked_store_is_reprobed_after_interval() {
        let store = FlakyStore::default();
        let guard = AvailabilityGuard::new(&config(true, 60))
            .with_check_interval(Duration::from_millis(20));
        guard.mark_unavailable();
        assert!(!guard.is_available(&store).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(guard.is_available(&store).await.unwrap());
        assert_eq!(store.probes.load(Ordering::SeqCst), 1);
    }
}
