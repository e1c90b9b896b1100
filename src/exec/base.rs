//! Immutable container snapshot and the power operations applied to it.
//!
//! A [`ContainerBase`] pairs the container's declared configuration with the
//! last `{config, runtime}` snapshot fetched from the backend. It is never
//! mutated in place: [`ContainerBase::refresh`] returns a new value.
//!
//! ## Stop Escalation
//!
//! ```text
//!   for sig in [stop_signal | TERM, KILL]:
//!       guest `kill <sig>`  ──►  wait poweredOff ≤ per-signal wait
//!           ok       → stopped
//!           timeout  → next signal
//!           other    → abort escalation
//!   exhausted/aborted → hard power off (fault policy decides benign races)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::{
    classify, Action, Disposition, Fault, GuestAuth, GuestProgramSpec, PowerState,
    VirtualMachine, VmConfig, VmRuntime,
};
use crate::constants::{session_started_key, GUEST_KILL_PROGRAM};
use crate::error::{Error, Result};
use crate::exec::state::State;
use crate::executor::ExecutorConfig;
use crate::signal::Signal;
use crate::trace::{Cause, Operation};

/// Outcome of a bounded power state wait.
#[derive(Debug)]
pub enum WaitOutcome {
    Reached,
    /// The wait's own bound expired.
    TimedOut,
    /// The caller's operation ended, or the backend failed.
    Failed(Error),
}

/// Declared configuration plus the last backend snapshot.
#[derive(Clone)]
pub struct ContainerBase {
    pub exec_config: ExecutorConfig,
    pub config: Option<VmConfig>,
    pub runtime: Option<VmRuntime>,
    pub vm: Option<Arc<dyn VirtualMachine>>,
}

impl fmt::Debug for ContainerBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerBase")
            .field("id", &self.exec_config.id)
            .field("version", &self.version())
            .field("power_state", &self.power_state())
            .field("vm", &self.vm.as_ref().map(|vm| vm.reference().to_string()))
            .finish()
    }
}

impl ContainerBase {
    /// Base for a container whose VM has not been created yet.
    #[must_use]
    pub fn new(exec_config: ExecutorConfig) -> Self {
        Self {
            exec_config,
            config: None,
            runtime: None,
            vm: None,
        }
    }

    /// Base built from a fetched snapshot.
    #[must_use]
    pub fn from_snapshot(
        vm: Arc<dyn VirtualMachine>,
        config: VmConfig,
        runtime: VmRuntime,
    ) -> Self {
        Self {
            exec_config: config.exec_config.clone(),
            config: Some(config),
            runtime: Some(runtime),
            vm: Some(vm),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.exec_config.id
    }

    /// Change version of the snapshot, if one was taken.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.change_version.as_str())
    }

    #[must_use]
    pub fn power_state(&self) -> Option<PowerState> {
        self.runtime.as_ref().map(|r| r.power_state)
    }

    /// Current state derived from the snapshot (Created without one).
    #[must_use]
    pub fn state(&self) -> State {
        match self.power_state() {
            Some(power) => State::from_power(power, self.exec_config.has_started()),
            None => State::Created,
        }
    }

    fn vm(&self) -> Result<&Arc<dyn VirtualMachine>> {
        self.vm.as_ref().ok_or_else(|| Error::NotYetExist {
            id: self.id().to_string(),
        })
    }

    /// Fetches a fresh snapshot from the backend.
    pub async fn refresh(&self, op: &Operation) -> Result<ContainerBase> {
        let vm = self.vm()?;
        let props = bounded(op, "refresh", vm.properties()).await?;
        match props {
            Ok(props) => Ok(Self::from_snapshot(vm.clone(), props.config, props.runtime)),
            Err(Fault::NotFound(_) | Fault::Unavailable(_)) => Err(Error::NotYetExist {
                id: self.id().to_string(),
            }),
            Err(fault) => Err(Error::backend("refresh", fault)),
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Powers the VM on and waits for the guest to report the primary launch.
    pub async fn start(&self, op: &Operation, report_timeout: Duration) -> Result<()> {
        let _t = op.begin("start container");
        let id = self.id();
        info!(op = %op.id(), id = %id, "container start");

        let vm = self.vm().inspect_err(|_| {
            error!(op = %op.id(), id = %id, "unable to start container without VM created");
        })?;

        if let Err(fault) = bounded(op, "power on", vm.power_on()).await? {
            match classify(Action::PowerOn, &fault) {
                (Disposition::Benign, reason) => {
                    warn!(op = %op.id(), id = %id, "power on skipped: {reason}");
                }
                _ => return Err(Error::backend("power on", fault)),
            }
        }

        let key = session_started_key(id);
        let wait = op.with_timeout(report_timeout);
        let detail = match wait.bounded(vm.wait_for_key(&key)).await {
            Ok(Ok(detail)) => detail,
            Ok(Err(fault)) => {
                return Err(Error::StartFailed {
                    id: id.to_string(),
                    reason: format!("unable to wait for process launch status: {fault}"),
                })
            }
            Err(cause) => {
                return Err(Error::StartFailed {
                    id: id.to_string(),
                    reason: format!("unable to wait for process launch status: {cause}"),
                })
            }
        };

        if detail != "true" {
            error!(op = %op.id(), id = %id, detail = %detail, "container start failed");
            return Err(Error::StartFailed {
                id: id.to_string(),
                reason: detail,
            });
        }

        info!(op = %op.id(), id = %id, "container started");
        Ok(())
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Graceful shutdown with a hard power off fallback.
    ///
    /// `wait` is the per-signal wait; `None` or zero uses `default_wait`.
    pub async fn stop(
        &self,
        op: &Operation,
        wait: Option<Duration>,
        default_wait: Duration,
    ) -> Result<()> {
        let _t = op.begin("stop container");
        let id = self.id();
        info!(op = %op.id(), id = %id, "container stop");

        let vm = self.vm().inspect_err(|_| {
            error!(op = %op.id(), id = %id, "unable to stop container without VM created");
        })?;

        let wait = wait.filter(|w| !w.is_zero()).unwrap_or(default_wait);
        let err = match self.shutdown(op, wait).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        warn!(op = %op.id(), id = %id, "stopping via hard power off due to: {err}");

        match bounded(op, "power off", vm.power_off()).await? {
            Ok(()) => {
                info!(op = %op.id(), id = %id, "container stopped");
                Ok(())
            }
            Err(fault) => match classify(Action::PowerOff, &fault) {
                (Disposition::Benign, reason) => {
                    warn!(op = %op.id(), id = %id, "power off task skipped: {reason}");
                    Ok(())
                }
                _ => {
                    error!(op = %op.id(), id = %id, "hard power off failed: {fault}");
                    Err(Error::StopFailed {
                        id: id.to_string(),
                        reason: fault.to_string(),
                    })
                }
            },
        }
    }

    /// Sends each stop signal in turn, waiting `wait` for power off after each.
    pub async fn shutdown(&self, op: &Operation, wait: Duration) -> Result<()> {
        let _t = op.begin("clean shutdown");
        let id = self.id();
        info!(op = %op.id(), id = %id, "container shutdown");

        let vm = self.vm()?;
        let signals = self.exec_config.stop_signals();

        for signal in &signals {
            let msg = format!("sending kill -{} {id}", signal.name());
            info!(op = %op.id(), id = %id, "{msg}");

            self.start_guest_program(op, GUEST_KILL_PROGRAM, signal.name())
                .await
                .map_err(|e| Error::SignalFailed {
                    id: id.to_string(),
                    reason: format!("{msg}: {e}"),
                })?;

            debug!(op = %op.id(), id = %id, "waiting {wait:?} for power off");
            match wait_for_power_state(op, vm, wait, PowerState::PoweredOff).await {
                WaitOutcome::Reached => {
                    info!(op = %op.id(), id = %id, "container shutdown");
                    return Ok(());
                }
                WaitOutcome::TimedOut => {
                    warn!(op = %op.id(), id = %id, "timeout ({wait:?}) waiting to power off via {signal}");
                }
                WaitOutcome::Failed(err) => {
                    error!(op = %op.id(), id = %id, "container shutdown failed: {err}");
                    return Err(err);
                }
            }
        }

        Err(Error::ShutdownFailed {
            id: id.to_string(),
            signals: signals.iter().map(|s| s.name().to_string()).collect(),
        })
    }

    /// Delivers `signal` to the primary process through the guest.
    pub async fn signal(&self, op: &Operation, signal: Signal) -> Result<()> {
        self.start_guest_program(op, GUEST_KILL_PROGRAM, signal.name())
            .await
            .map(|_| ())
            .map_err(|e| Error::SignalFailed {
                id: self.id().to_string(),
                reason: e.to_string(),
            })
    }

    /// Runs `program` in the guest, authenticated as the container id.
    pub async fn start_guest_program(
        &self,
        op: &Operation,
        program: &str,
        args: &str,
    ) -> Result<i64> {
        let vm = self.vm()?;
        let auth = GuestAuth {
            username: self.id().to_string(),
        };
        let spec = GuestProgramSpec {
            program_path: program.to_string(),
            arguments: args.to_string(),
        };
        bounded(op, "start guest program", vm.start_guest_program(&auth, &spec))
            .await?
            .map_err(|fault| Error::backend("start guest program", fault))
    }
}

/// Waits up to `max` for `vm` to reach `state`, telling apart the wait's own
/// timeout from the caller's operation ending.
pub async fn wait_for_power_state(
    op: &Operation,
    vm: &Arc<dyn VirtualMachine>,
    max: Duration,
    state: PowerState,
) -> WaitOutcome {
    let _t = op.begin(format!("wait for power state {state}"));
    let timeout = op.with_timeout(max);
    match timeout.bounded(vm.wait_for_power_state(state)).await {
        Ok(Ok(())) => WaitOutcome::Reached,
        Ok(Err(fault)) => WaitOutcome::Failed(Error::backend("wait for power state", fault)),
        Err(cause) => match op.err() {
            Some(parent) => WaitOutcome::Failed(Error::Cancelled {
                operation: op.name().to_string(),
                cause: parent,
            }),
            None if cause == Cause::DeadlineExceeded => WaitOutcome::TimedOut,
            None => WaitOutcome::Failed(Error::Cancelled {
                operation: op.name().to_string(),
                cause,
            }),
        },
    }
}

/// Bounds a backend call by `op`, mapping an ended operation to an error.
pub(crate) async fn bounded<F: std::future::Future>(
    op: &Operation,
    what: &str,
    fut: F,
) -> Result<F::Output> {
    op.bounded(fut).await.map_err(|cause| Error::Cancelled {
        operation: what.to_string(),
        cause,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{GuestBehavior, MemoryBackend};
    use crate::backend::{Backend, VmSpec};
    use crate::executor::CreateConfig;

    async fn base(backend: &MemoryBackend, id: &str) -> ContainerBase {
        let cfg = CreateConfig {
            name: "t".into(),
            path: "/bin/true".into(),
            ..Default::default()
        }
        .into_executor_config(id);
        let vm = backend.create_vm(&VmSpec::for_container(&cfg)).await.unwrap();
        ContainerBase {
            vm: Some(vm),
            ..ContainerBase::new(cfg)
        }
        .refresh(&Operation::new("test"))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_state_without_snapshot_is_created() {
        let cfg = ExecutorConfig::default();
        let base = ContainerBase::new(cfg);
        assert_eq!(base.state(), State::Created);
        assert!(base.version().is_none());
    }

    #[tokio::test]
    async fn test_refresh_on_unreachable_host_is_not_yet_exist() {
        let backend = MemoryBackend::new();
        let base = base(&backend, "u1").await;
        backend.vm("u1").unwrap().set_unreachable(true);

        let err = base.refresh(&Operation::new("refresh")).await.unwrap_err();
        assert!(
            matches!(err, Error::NotYetExist { ref id } if id == "u1"),
            "unavailable backend should read as not yet existing, got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_start_then_refresh_is_running() {
        let backend = MemoryBackend::new();
        let base = base(&backend, "s1").await;
        let op = Operation::new("start");
        base.start(&op, Duration::from_secs(1)).await.unwrap();
        let fresh = base.refresh(&op).await.unwrap();
        assert_eq!(fresh.state(), State::Running);
        assert_ne!(fresh.version(), base.version());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_report_times_out() {
        let backend = MemoryBackend::with_guest(GuestBehavior {
            start_detail: None,
            ..GuestBehavior::default()
        });
        let base = base(&backend, "s2").await;
        let err = base
            .start(&Operation::new("start"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::StartFailed { reason, .. } if reason.contains("unable to wait for process launch status"))
        );
    }

    #[tokio::test]
    async fn test_refresh_without_vm_is_not_yet_exist() {
        let base = ContainerBase::new(ExecutorConfig {
            id: "nope".into(),
            ..Default::default()
        });
        let err = base.refresh(&Operation::new("r")).await.unwrap_err();
        assert!(matches!(err, Error::NotYetExist { id } if id == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_first_signal_suffices() {
        let backend = MemoryBackend::new();
        let base = base(&backend, "s3").await;
        let op = Operation::new("stop");
        base.start(&op, Duration::from_secs(1)).await.unwrap();
        base.shutdown(&op, Duration::from_secs(10)).await.unwrap();
        assert_eq!(backend.vm("s3").unwrap().signals(), vec!["TERM"]);
    }
}
