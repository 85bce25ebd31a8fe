use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    CacheHit,
    QueryResultCached,
    QueryResultInvalidated,
    CachingSkipped,
    InvalidationSkipped,
    CachePolicyCalculated,
    CacheDependenciesCalculated,
    CachingSystemStarted,
    CachingError,
}

impl fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub command_text: Option<String>,
    pub message: String,
}

impl CacheEvent {
    pub fn new(kind: CacheEventKind, command_text: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            command_text: command_text.map(str::to_string),
            message: message.into(),
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fans events out to subscribers and to `tracing`.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, EventCallback)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn emit(&self, event: CacheEvent) {
        match event.kind {
            CacheEventKind::CachingError => error!("{}: {}", event.kind, event.message),
            CacheEventKind::CachingSystemStarted => info!("{}: {}", event.kind, event.message),
            _ => debug!("{}: {}", event.kind, event.message),
        }

        // callbacks run outside the lock so they may subscribe themselves
        let subscribers: Vec<EventCallback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in subscribers {
            callback(&event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
