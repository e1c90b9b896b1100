//! Registry of committed containers.
//!
//! Readers get whole `Arc<Container>` values and never observe a partially
//! updated entry. Every `put` wakes the state waiters of that id.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::debug;

use super::base::ContainerBase;
use super::container::Container;
use super::state::State;

/// Container id → latest committed entry.
#[derive(Debug, Default)]
pub struct ContainerCache {
    entries: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking lookup.
    #[must_use]
    pub fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All entries, optionally only those in `filter` state.
    #[must_use]
    pub fn containers(&self, filter: Option<State>) -> Vec<Arc<Container>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = entries
            .values()
            .filter(|c| filter.map_or(true, |s| c.current_state() == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Replaces the entry for `base`'s id and publishes its state.
    pub fn put(&self, base: ContainerBase) -> Arc<Container> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Self::insert(&mut entries, base)
    }

    /// Like [`put`](Self::put), but only if `base`'s id is still registered.
    pub fn replace_if_present(&self, base: ContainerBase) -> Option<Arc<Container>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(base.id()) {
            debug!(id = %base.id(), "entry removed, not replacing");
            return None;
        }
        Some(Self::insert(&mut entries, base))
    }

    /// Drops the entry for `id`, failing its waiters.
    pub fn remove(&self, id: &str) -> Option<Arc<Container>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(id);
        if let Some(container) = &removed {
            container.events().send_replace(None);
        }
        removed
    }

    // Publishing happens under the write lock so the watched state always
    // matches the entry that is visible.
    fn insert(
        entries: &mut HashMap<String, Arc<Container>>,
        base: ContainerBase,
    ) -> Arc<Container> {
        let id = base.id().to_string();
        let state = base.state();
        let events = entries
            .get(&id)
            .map(|c| c.events().clone())
            .unwrap_or_else(|| Arc::new(watch::channel(Some(state)).0));
        let container = Arc::new(Container::new(base, events.clone()));
        entries.insert(id.clone(), container.clone());
        events.send_replace(Some(state));

        debug!(id = %id, state = %state, "registry entry replaced");
        container
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
