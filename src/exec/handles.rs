//! Pending handle cache.
//!
//! API callers stage changes over several requests, so an uncommitted handle
//! is parked here under its reference between calls. Parked handles expire
//! after a TTL, and the cache never holds more than its capacity (oldest
//! first out). Taking a handle removes it: whoever holds the `Handle` value
//! owns it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::handle::Handle;

struct Parked {
    handle: Handle,
    parked_at: Instant,
}

/// Reference → pending handle.
pub struct HandleCache {
    handles: Mutex<HashMap<String, Parked>>,
    ttl: Duration,
    capacity: usize,
}

impl std::fmt::Debug for HandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl HandleCache {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Parks `handle`, returning its reference.
    pub fn put(&self, handle: Handle) -> String {
        let reference = handle.reference().to_string();
        let now = Instant::now();
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        self.expire(&mut handles, now);

        while handles.len() >= self.capacity && !handles.contains_key(&reference) {
            let Some(oldest) = handles
                .iter()
                .min_by_key(|(_, p)| p.parked_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(handle = %oldest, "evicting oldest pending handle");
            handles.remove(&oldest);
        }

        handles.insert(
            reference.clone(),
            Parked {
                handle,
                parked_at: now,
            },
        );
        reference
    }

    /// Takes the handle parked under `reference`, if it has not expired.
    pub fn take(&self, reference: &str) -> Option<Handle> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        self.expire(&mut handles, Instant::now());
        handles.remove(reference).map(|p| p.handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, handles: &mut HashMap<String, Parked>, now: Instant) {
        handles.retain(|reference, parked| {
            let live = now.duration_since(parked.parked_at) < self.ttl;
            if !live {
                debug!(handle = %reference, "pending handle expired");
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::base::ContainerBase;
    use crate::executor::ExecutorConfig;
    use crate::trace::Operation;

    fn handle(id: &str) -> Handle {
        let base = ContainerBase::new(ExecutorConfig {
            id: id.to_string(),
            ..Default::default()
        });
        Handle::new(base, Operation::new("test"), 0)
    }

    #[test]
    fn test_take_removes() {
        let cache = HandleCache::new(Duration::from_secs(60), 10);
        let reference = cache.put(handle("a"));
        assert!(cache.take(&reference).is_some());
        assert!(cache.take(&reference).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = HandleCache::new(Duration::from_secs(60), 2);
        let first = cache.put(handle("a"));
        std::thread::sleep(Duration::from_millis(2));
        let second = cache.put(handle("b"));
        std::thread::sleep(Duration::from_millis(2));
        let third = cache.put(handle("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.take(&first).is_none());
        assert!(cache.take(&second).is_some());
        assert!(cache.take(&third).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_handles_are_dropped() {
        let cache = HandleCache::new(Duration::from_secs(60), 10);
        let reference = cache.put(handle("a"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.take(&reference).is_none());
        assert!(cache.is_empty());
    }
}
