//! # Container Lifecycle
//!
//! One VM per container. Callers never touch the backend directly: they take
//! a [`Handle`], stage changes on it, and [`Handle::commit`] it. Commits are
//! optimistic; a handle staged from a snapshot that is no longer current is
//! rejected with [`crate::Error::ConcurrentAccess`] and never retried here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── Exec ────────────────────────────┐
//! │                                                              │
//! │  HandleCache          CommitGate           ContainerCache    │
//! │  ref → Handle         id → claimed ver     id → Arc<Container>
//! │      ▲  │                  ▲                      ▲          │
//! │ stash│  │get_handle        │ claim                │ put      │
//! │      │  ▼                  │                      │          │
//! │   Handle ──── commit ──────┴────── Backend ───────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let exec = Exec::new(backend, &Config::default());
//! let op = Operation::new("run");
//! let mut handle = exec.create(&op, create_config)?;
//! handle.set_target_state(State::Running);
//! handle.commit(&op, &exec, None).await?;
//! ```

pub mod base;
pub mod cache;
pub mod container;
pub mod gate;
pub mod handle;
pub mod handles;
pub mod state;
pub mod task;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::Result;
use crate::executor::{new_container_id, CreateConfig};
use crate::trace::Operation;

pub use base::ContainerBase;
pub use cache::ContainerCache;
pub use container::Container;
pub use gate::CommitGate;
pub use handle::Handle;
pub use handles::HandleCache;
pub use state::State;

/// Lifecycle service: owns the backend session, the registry, pending
/// handles, and the commit gate.
pub struct Exec {
    backend: Arc<dyn Backend>,
    containers: ContainerCache,
    handles: HandleCache,
    gate: CommitGate,
    config: Config,
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec")
            .field("backend", &self.backend.name())
            .field("containers", &self.containers.len())
            .field("handles", &self.handles)
            .finish()
    }
}

impl Exec {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        info!(backend = %backend.name(), "lifecycle service ready");
        Self {
            backend,
            containers: ContainerCache::new(),
            handles: HandleCache::new(config.handle_ttl(), config.max_pending_handles),
            gate: CommitGate::new(),
            config: config.clone(),
        }
    }

    /// Stages a new container; the VM is created when the handle commits.
    pub fn create(&self, op: &Operation, create: CreateConfig) -> Result<Handle> {
        create.validate()?;
        let id = new_container_id();
        info!(op = %op.id(), id = %id, name = %create.name, "staging container create");
        let exec_config = create.into_executor_config(&id);
        Ok(Handle::for_create(
            exec_config,
            op.child(format!("handle {id}")),
            self.gate.next_serial(),
        ))
    }

    /// Takes a stashed handle; `None` if unknown or expired.
    pub fn get_handle(&self, reference: &str) -> Option<Handle> {
        let handle = self.handles.take(reference);
        if handle.is_none() {
            debug!(handle = %reference, "handle not found");
        }
        handle
    }

    /// Parks `handle` until the caller's next request, returning its reference.
    pub fn stash(&self, handle: Handle) -> String {
        self.handles.put(handle)
    }

    /// New handle over the committed state of container `id`.
    pub fn get_container(&self, op: &Operation, id: &str) -> Option<Handle> {
        let container = self.containers.container(id)?;
        Some(Handle::new(
            container.base().clone(),
            op.child(format!("handle {id}")),
            self.gate.next_serial(),
        ))
    }

    /// Committed entry of container `id`.
    #[must_use]
    pub fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.containers.container(id)
    }

    /// Drops everything known about `id`.
    pub(crate) fn forget(&self, id: &str) {
        self.containers.remove(id);
        self.gate.release(id);
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn containers(&self) -> &ContainerCache {
        &self.containers
    }

    #[must_use]
    pub fn handles(&self) -> &HandleCache {
        &self.handles
    }

    #[must_use]
    pub fn gate(&self) -> &CommitGate {
        &self.gate
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}
