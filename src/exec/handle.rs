//! Staged container mutations and the commit algorithm.
//!
//! A [`Handle`] is a private, single-owner copy of a container's state that
//! callers mutate freely (target state, configuration changes) before calling
//! [`Handle::commit`]. Commit reconciles the staged changes against the
//! backend using optimistic concurrency:
//!
//! ```text
//!   ┌ no VM yet ─► create VM, snapshot, register ─┐
//!   │                                              ▼
//!   └ VM ───────► fetch snapshot ─► version == base version? ──no──► ConcurrentAccess
//!                                                  │ yes
//!                                   gate.claim(id, version)   ──busy──► ConcurrentAccess
//!                                                  │
//!                       stop? ─► reconfigure? (CAS on version) ─► start?
//!                                                  │
//!                              refresh, replace registry entry, complete claim
//! ```
//!
//! Nothing is retried: a conflicting caller gets an error and must re-read.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::base::{bounded, ContainerBase};
use super::state::State;
use super::Exec;
use crate::backend::{classify, Action, Disposition, PowerState, VmSpec};
use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;
use crate::trace::Operation;

/// Staging object for container changes.
pub struct Handle {
    key: String,
    base: ContainerBase,
    target: Option<State>,
    spec: Option<VmSpec>,
    reload: bool,
    op: Operation,
    serial: u64,
    staged_at: Instant,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("id", &self.base.id())
            .field("target", &self.target)
            .field("create", &self.spec.is_some())
            .field("reload", &self.reload)
            .finish()
    }
}

impl Handle {
    /// Handle over `base`, staged at `serial` (see [`super::gate`]).
    #[must_use]
    pub fn new(base: ContainerBase, op: Operation, serial: u64) -> Self {
        Self {
            key: uuid::Uuid::new_v4().simple().to_string(),
            base,
            target: None,
            spec: None,
            reload: false,
            op,
            serial,
            staged_at: Instant::now(),
        }
    }

    /// Handle that creates the VM for `exec_config` on commit.
    #[must_use]
    pub(crate) fn for_create(exec_config: ExecutorConfig, op: Operation, serial: u64) -> Self {
        let spec = VmSpec::for_container(&exec_config);
        let mut handle = Self::new(ContainerBase::new(exec_config), op, serial);
        handle.spec = Some(spec);
        handle
    }

    /// Opaque reference under which the handle can be stashed.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.base.id()
    }

    /// Snapshot the handle was staged from.
    #[must_use]
    pub fn base(&self) -> &ContainerBase {
        &self.base
    }

    /// Staged configuration.
    #[must_use]
    pub fn exec_config(&self) -> &ExecutorConfig {
        &self.base.exec_config
    }

    /// Mutable staged configuration; call [`Handle::reload`] to have it
    /// written on commit.
    pub fn exec_config_mut(&mut self) -> &mut ExecutorConfig {
        &mut self.base.exec_config
    }

    #[must_use]
    pub fn target_state(&self) -> Option<State> {
        self.target
    }

    pub fn set_target_state(&mut self, state: State) {
        self.target = Some(state);
    }

    /// Marks the staged configuration for writing on commit.
    pub fn reload(&mut self) {
        self.reload = true;
    }

    #[must_use]
    pub fn needs_reload(&self) -> bool {
        self.reload
    }

    /// True if commit will create the VM.
    #[must_use]
    pub fn is_create(&self) -> bool {
        self.base.vm.is_none()
    }

    /// Operation the handle was staged under.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// How long ago the handle was staged.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.staged_at.elapsed()
    }

    /// Applies the staged changes under the committing caller's `op`.
    ///
    /// The staging operation only identifies where the handle came from; a
    /// handle stashed by one caller stays committable after that caller's
    /// deadline. `wait_time` is the per-signal wait used when stopping.
    pub async fn commit(
        mut self,
        op: &Operation,
        exec: &Exec,
        wait_time: Option<Duration>,
    ) -> Result<()> {
        let _t = op.begin(format!("commit handle {}", self.key));
        let id = self.id().to_string();
        info!(op = %op.id(), staged_by = %self.op.id(), id = %id, "committing handle");

        let current = if self.is_create() {
            self.create(op, exec).await?
        } else {
            self.base.refresh(op).await?
        };

        let version = current.version().unwrap_or_default().to_string();
        let expected = self.base.version().unwrap_or_default().to_string();
        if version != expected {
            warn!(op = %op.id(), id = %id, expected = %expected, found = %version, "stale handle");
            return Err(Error::ConcurrentAccess {
                id,
                detail: format!("expected version {expected} but found {version}"),
            });
        }

        let claim = exec
            .gate()
            .claim(&id, &version, self.serial)
            .map_err(|detail| Error::ConcurrentAccess {
                id: id.clone(),
                detail,
            })?;

        self.validate_transition(&current)?;

        match self.apply(op, exec, current.clone(), wait_time).await {
            Ok(applied) => {
                let fresh = applied.refresh(op).await?;
                info!(op = %op.id(), id = %id, state = %fresh.state(), "committed");
                exec.containers().put(fresh);
                claim.complete();
                Ok(())
            }
            Err(err) => {
                // Record whatever the backend reached before the failure,
                // unless the container was removed meanwhile.
                if let Ok(fresh) = current.refresh(op).await {
                    exec.containers().replace_if_present(fresh);
                }
                Err(err)
            }
        }
    }

    async fn create(&mut self, op: &Operation, exec: &Exec) -> Result<ContainerBase> {
        let spec = self
            .spec
            .take()
            .unwrap_or_else(|| VmSpec::for_container(&self.base.exec_config));
        info!(op = %op.id(), id = %self.id(), backend = %exec.backend().name(), "creating container VM");

        let vm = bounded(op, "create vm", exec.backend().create_vm(&spec))
            .await?
            .map_err(|fault| Error::backend("create vm", fault))?;

        let created = ContainerBase {
            vm: Some(vm),
            ..ContainerBase::new(self.base.exec_config.clone())
        }
        .refresh(op)
        .await?;

        // Visible to readers even if the rest of the commit fails.
        exec.containers().put(created.clone());
        self.base.vm = created.vm.clone();
        self.base.config = created.config.clone();
        self.base.runtime = created.runtime.clone();
        Ok(created)
    }

    fn validate_transition(&self, current: &ContainerBase) -> Result<()> {
        let from = current.state();
        match self.target {
            Some(State::Created) if from != State::Created => Err(Error::InvalidTransition {
                id: self.id().to_string(),
                from: from.to_string(),
                to: State::Created.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn apply(
        &self,
        op: &Operation,
        exec: &Exec,
        current: ContainerBase,
        wait_time: Option<Duration>,
    ) -> Result<ContainerBase> {
        let id = self.id();
        let mut working = ContainerBase {
            exec_config: self.base.exec_config.clone(),
            ..current
        };
        let powered_on = |b: &ContainerBase| b.power_state() == Some(PowerState::PoweredOn);

        if self.target == Some(State::Stopped) {
            if powered_on(&working) {
                working
                    .stop(op, wait_time, exec.config().default_stop_wait())
                    .await?;
                working = ContainerBase {
                    exec_config: self.base.exec_config.clone(),
                    ..working.refresh(op).await?
                };
            } else {
                info!(op = %op.id(), id = %id, "dropping duplicate stop operation");
            }
        }

        if self.reload {
            self.reconfigure(op, &working).await?;
            working = ContainerBase {
                exec_config: self.base.exec_config.clone(),
                ..working.refresh(op).await?
            };
        }

        if self.target == Some(State::Running) {
            if powered_on(&working) {
                info!(op = %op.id(), id = %id, "dropping duplicate start operation");
            } else {
                working
                    .start(op, exec.config().start_report_timeout())
                    .await?;
            }
        }

        Ok(working)
    }

    async fn reconfigure(&self, op: &Operation, working: &ContainerBase) -> Result<()> {
        let _t = op.begin("reconfigure");
        let id = self.id();
        let Some(vm) = working.vm.as_ref() else {
            return Err(Error::NotYetExist { id: id.to_string() });
        };
        let version = working.version().unwrap_or_default();

        match bounded(op, "reconfigure", vm.reconfigure(version, &self.base.exec_config)).await? {
            Ok(()) => Ok(()),
            Err(fault) => match classify(Action::Reconfigure, &fault) {
                (Disposition::Retry, reason) => {
                    warn!(op = %op.id(), id = %id, "reconfigure rejected: {reason}");
                    Err(Error::ConcurrentAccess {
                        id: id.to_string(),
                        detail: fault.to_string(),
                    })
                }
                _ => Err(Error::backend("reconfigure", fault)),
            },
        }
    }
}
