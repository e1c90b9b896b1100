//! Committed container entries.
//!
//! A [`Container`] is an immutable snapshot published by a successful commit.
//! Consecutive entries for the same id share one `watch` channel of states,
//! so waiters registered against an old entry still see later commits.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{info, warn};

use super::base::{bounded, ContainerBase};
use super::state::State;
use super::Exec;
use crate::backend::{Fault, LogStream, PowerState};
use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;
use crate::signal::Signal;
use crate::trace::Operation;

/// State events for one container id; `None` once the container is removed.
pub(crate) type StateEvents = Arc<watch::Sender<Option<State>>>;

/// Registry entry for a committed container.
pub struct Container {
    base: ContainerBase,
    events: StateEvents,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("base", &self.base)
            .field("state", &self.current_state())
            .finish()
    }
}

impl Container {
    pub(crate) fn new(base: ContainerBase, events: StateEvents) -> Self {
        Self { base, events }
    }

    pub(crate) fn events(&self) -> &StateEvents {
        &self.events
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.base.id()
    }

    #[must_use]
    pub fn base(&self) -> &ContainerBase {
        &self.base
    }

    #[must_use]
    pub fn exec_config(&self) -> &ExecutorConfig {
        &self.base.exec_config
    }

    /// Change version of the committed snapshot.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.base.version()
    }

    #[must_use]
    pub fn current_state(&self) -> State {
        self.base.state()
    }

    /// Resolves once the entry for this id reaches `target`.
    ///
    /// Fails with [`Error::NotFound`] if the container is removed first.
    /// Unbounded; callers wrap it in their own timeout.
    pub async fn wait_for_state(&self, target: State) -> Result<()> {
        let mut rx = self.events.subscribe();
        let reached = rx
            .wait_for(|state| state.is_none() || *state == Some(target))
            .await
            .map_err(|_| Error::NotFound(self.id().to_string()))?
            .is_some();
        if reached {
            Ok(())
        } else {
            Err(Error::NotFound(self.id().to_string()))
        }
    }

    /// Destroys the VM and drops the registry entry.
    pub async fn remove(&self, op: &Operation, exec: &Exec) -> Result<()> {
        let _t = op.begin(format!("remove {}", self.id()));
        let id = self.id().to_string();

        let vm = bounded(op, "find vm", exec.backend().find_vm(&id))
            .await?
            .map_err(|fault| Error::backend("find vm", fault))?;
        let Some(vm) = vm else {
            warn!(op = %op.id(), id = %id, "vm not found on backend, dropping entry");
            exec.forget(&id);
            return Err(Error::NotFound(id));
        };

        let props = bounded(op, "properties", vm.properties())
            .await?
            .map_err(|fault| Error::backend("properties", fault))?;
        if props.runtime.power_state == PowerState::PoweredOn {
            return Err(Error::RemovePower { id });
        }

        match bounded(op, "destroy", vm.destroy()).await? {
            Ok(()) => {}
            Err(Fault::InvalidPowerState {
                existing: PowerState::PoweredOn,
            }) => return Err(Error::RemovePower { id }),
            Err(Fault::NotFound(_)) => {
                exec.forget(&id);
                return Err(Error::NotFound(id));
            }
            Err(fault) => return Err(Error::backend("destroy", fault)),
        }

        exec.forget(&id);
        info!(op = %op.id(), id = %id, "container removed");
        Ok(())
    }

    /// Sends `signal` to the container's primary process.
    pub async fn signal(&self, op: &Operation, signal: Signal) -> Result<()> {
        let _t = op.begin(format!("signal {} {signal}", self.id()));
        info!(op = %op.id(), id = %self.id(), signal = %signal, "signal container");
        self.base.signal(op, signal).await
    }

    /// Opens the container log.
    ///
    /// `tail` keeps only the last N lines of existing output. With `follow`,
    /// the reader keeps delivering new output while the container runs.
    pub async fn log_reader(
        &self,
        op: &Operation,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<LogStream> {
        let vm = self.base.vm.as_ref().ok_or_else(|| Error::NotYetExist {
            id: self.id().to_string(),
        })?;

        let mut data = bounded(op, "read log", vm.read_log())
            .await?
            .map_err(|fault| Error::backend("read log", fault))?;
        let end = data.len() as u64;
        if let Some(lines) = tail {
            data.drain(..tail_offset(&data, lines));
        }

        let head = Cursor::new(data);
        if !follow {
            return Ok(Box::pin(head));
        }

        let rest = bounded(op, "follow log", vm.follow_log(end))
            .await?
            .map_err(|fault| Error::backend("follow log", fault))?;
        Ok(Box::pin(head.chain(rest)))
    }
}

/// Byte offset where the last `lines` lines of `data` begin.
fn tail_offset(data: &[u8], lines: usize) -> usize {
    if lines == 0 {
        return data.len();
    }
    let body = match data.last() {
        Some(b'\n') => &data[..data.len() - 1],
        _ => data,
    };
    body.iter()
        .enumerate()
        .rev()
        .filter(|(_, b)| **b == b'\n')
        .nth(lines - 1)
        .map_or(0, |(i, _)| i + 1)
}
