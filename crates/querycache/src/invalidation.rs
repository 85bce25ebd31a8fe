use dashmap::DashMap;
use querycache_core::CacheTag;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Handle observed at insert time; goes stale once its tag (or everything) is invalidated.
#[derive(Clone)]
pub struct TagToken {
    tag: CacheTag,
    version: Arc<AtomicU64>,
    observed_version: u64,
    epoch: Arc<AtomicU64>,
    observed_epoch: u64,
}

impl TagToken {
    pub fn tag(&self) -> &CacheTag {
        &self.tag
    }

    pub fn is_valid(&self) -> bool {
        self.version.load(Ordering::Acquire) == self.observed_version
            && self.epoch.load(Ordering::Acquire) == self.observed_epoch
    }
}

impl fmt::Debug for TagToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagToken")
            .field("tag", &self.tag)
            .field("observed_version", &self.observed_version)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Table-scoped change notification used by stores to invalidate by tag.
pub trait TagInvalidationNotifier: Send + Sync {
    fn get_or_create(&self, tag: &CacheTag) -> TagToken;

    fn invalidate(&self, tag: &CacheTag);

    fn invalidate_all(&self);
}

/// Versioned counters per tag plus one global epoch.
///
/// Invalidating a tag bumps its counter, which turns every token handed out
/// before the bump stale. Tokens created after the bump are valid again, so an
/// insert racing an invalidation either sees the old version (and dies with
/// it) or the new one.
#[derive(Debug, Default)]
pub struct VersionedTagNotifier {
    versions: DashMap<CacheTag, Arc<AtomicU64>>,
    epoch: Arc<AtomicU64>,
}

impl VersionedTagNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_tags(&self) -> usize {
        self.versions.len()
    }
}

impl TagInvalidationNotifier for VersionedTagNotifier {
    fn get_or_create(&self, tag: &CacheTag) -> TagToken {
        let version = self
            .versions
            .entry(tag.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .value()
            .clone();
        let observed_version = version.load(Ordering::Acquire);

        TagToken {
            tag: tag.clone(),
            version,
            observed_version,
            epoch: Arc::clone(&self.epoch),
            observed_epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    fn invalidate(&self, tag: &CacheTag) {
        if let Some(version) = self.versions.get(tag) {
            let new_version = version.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("Invalidated tag {} (version {})", tag, new_version);
        }
    }

    fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        debug!("Invalidated all tags");
    }
}
