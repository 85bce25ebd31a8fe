use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide mutual exclusion around lookup, execute and insert.
///
/// One gate per engine, not per key: concurrent misses for the same key both
/// execute and the last write wins. Only mutual exclusion is promised, not ordering.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    lock: Option<Arc<Mutex<()>>>,
}

/// Held for the critical section; released on drop, including unwinds.
#[derive(Debug)]
pub struct GateGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl ConcurrencyGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            lock: enabled.then(|| Arc::new(Mutex::new(()))),
        }
    }

    /// A gate that never blocks.
    pub fn pass_through() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock.is_some()
    }

    pub async fn acquire(&self) -> GateGuard {
        match &self.lock {
            Some(lock) => GateGuard {
                _guard: Some(Arc::clone(lock).lock_owned().await),
            },
            None => GateGuard { _guard: None },
        }
    }

    /// Blocking variant for synchronous callers. Must not be called from
    /// within an async execution context.
    pub fn acquire_blocking(&self) -> GateGuard {
        match &self.lock {
            Some(lock) => GateGuard {
                _guard: Some(Arc::clone(lock).blocking_lock_owned()),
            },
            None => GateGuard { _guard: None },
        }
    }

    pub fn try_acquire(&self) -> Option<GateGuard> {
        match &self.lock {
            Some(lock) => Arc::clone(lock)
                .try_lock_owned()
                .ok()
                .map(|guard| GateGuard {
                    _guard: Some(guard),
                }),
            None => Some(GateGuard { _guard: None }),
        }
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(true)
    }
}
