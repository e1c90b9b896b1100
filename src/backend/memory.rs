//! In-memory backend.
//!
//! Every VM is a `watch` channel of [`VmState`]; mutations bump the change
//! version and wake anything waiting on a power state or a published key. A
//! configurable [`GuestBehavior`] stands in for the in-guest supervisor:
//! it reports session launches on power on and powers the VM off when it
//! receives one of its exit signals.
//!
//! ```rust,ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let exec = Exec::new(backend.clone(), &Config::default());
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{
    Backend, Fault, GuestAuth, GuestProgramSpec, LogStream, PowerState, Properties,
    VirtualMachine, VmConfig, VmRuntime, VmSpec,
};
use crate::constants::{session_started_key, GUEST_KILL_PROGRAM};
use crate::executor::ExecutorConfig;
use crate::signal::Signal;

// =============================================================================
// Guest Simulation
// =============================================================================

/// How the simulated guest reacts to host actions.
#[derive(Debug, Clone)]
pub struct GuestBehavior {
    /// Launch detail published for every session on power on (`"true"` on
    /// success). `None` means the guest never reports.
    pub start_detail: Option<String>,
    /// Signals that make the guest exit and power the VM off.
    pub exits_on: Vec<Signal>,
    /// Fault returned by every hard power off.
    pub power_off_fault: Option<Fault>,
    /// The guest powers off concurrently with a faulted hard power off.
    pub shutdown_during_power_off: bool,
    /// Fault returned by every guest program start.
    pub guest_program_fault: Option<Fault>,
}

impl Default for GuestBehavior {
    fn default() -> Self {
        Self {
            start_detail: Some("true".to_string()),
            exits_on: vec![Signal::Term, Signal::Kill],
            power_off_fault: None,
            shutdown_during_power_off: false,
            guest_program_fault: None,
        }
    }
}

impl GuestBehavior {
    /// A guest that ignores every signal.
    #[must_use]
    pub fn stubborn() -> Self {
        Self {
            exits_on: Vec::new(),
            ..Self::default()
        }
    }
}

/// Observable state of a simulated VM.
#[derive(Debug, Clone)]
pub struct VmState {
    pub version: u64,
    pub power: PowerState,
    pub exec_config: ExecutorConfig,
    pub boot_time: Option<chrono::DateTime<Utc>>,
    pub published: HashMap<String, String>,
    pub programs: Vec<GuestProgramSpec>,
    pub log: Vec<u8>,
    pub destroyed: bool,
    /// The host stops answering property queries.
    pub unreachable: bool,
    pub guest: GuestBehavior,
}

impl VmState {
    fn power_off(&mut self, exit_status: i32) {
        let now = Utc::now().timestamp();
        self.power = PowerState::PoweredOff;
        for session in self.exec_config.sessions.values_mut() {
            session.stop_time = now;
            session.exit_status = exit_status;
        }
        self.version += 1;
    }
}

// =============================================================================
// MemoryVm
// =============================================================================

/// A simulated VM.
#[derive(Debug)]
pub struct MemoryVm {
    reference: String,
    state: watch::Sender<VmState>,
}

impl MemoryVm {
    fn new(reference: String, exec_config: ExecutorConfig, guest: GuestBehavior) -> Self {
        let (state, _) = watch::channel(VmState {
            version: 1,
            power: PowerState::PoweredOff,
            exec_config,
            boot_time: None,
            published: HashMap::new(),
            programs: Vec::new(),
            log: Vec::new(),
            destroyed: false,
            unreachable: false,
            guest,
        });
        Self { reference, state }
    }

    /// Applies `f` to the state; the change is published only if `f` succeeds.
    fn update<R>(&self, f: impl FnOnce(&mut VmState) -> Result<R, Fault>) -> Result<R, Fault> {
        let mut out = None;
        self.state.send_if_modified(|state| {
            if state.destroyed {
                out = Some(Err(Fault::NotFound(self.reference.clone())));
                return false;
            }
            let result = f(state);
            let modified = result.is_ok();
            out = Some(result);
            modified
        });
        out.unwrap_or_else(|| Err(Fault::Other("state update skipped".to_string())))
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> VmState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    #[must_use]
    pub fn power_state(&self) -> PowerState {
        self.state.borrow().power
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Signal names delivered through the guest kill program, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<String> {
        self.state
            .borrow()
            .programs
            .iter()
            .filter(|p| p.program_path == GUEST_KILL_PROGRAM)
            .map(|p| p.arguments.clone())
            .collect()
    }

    /// Replaces the guest behavior.
    pub fn set_guest(&self, guest: GuestBehavior) {
        self.state.send_modify(|state| state.guest = guest);
    }

    /// Appends container output to the log.
    pub fn append_log(&self, data: &[u8]) {
        self.state.send_modify(|state| state.log.extend_from_slice(data));
    }

    /// The guest powers itself off.
    pub fn guest_shutdown(&self) {
        self.state.send_if_modified(|state| {
            if state.power != PowerState::PoweredOn {
                return false;
            }
            state.power_off(0);
            true
        });
    }

    /// Simulates losing (or regaining) the connection to the VM's host.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.send_modify(|state| state.unreachable = unreachable);
    }

    /// Another client modifies the VM, advancing the change version.
    pub fn touch(&self) {
        self.state.send_modify(|state| state.version += 1);
    }

    /// The guest publishes a key.
    pub fn publish(&self, key: &str, value: &str) {
        self.state.send_modify(|state| {
            state.published.insert(key.to_string(), value.to_string());
        });
    }
}

#[async_trait]
impl VirtualMachine for MemoryVm {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn properties(&self) -> Result<Properties, Fault> {
        let state = self.state.borrow();
        if state.destroyed {
            return Err(Fault::NotFound(self.reference.clone()));
        }
        if state.unreachable {
            return Err(Fault::Unavailable(format!("host of {} unreachable", self.reference)));
        }
        Ok(Properties {
            config: VmConfig {
                change_version: state.version.to_string(),
                exec_config: state.exec_config.clone(),
            },
            runtime: VmRuntime {
                power_state: state.power,
                boot_time: state.boot_time,
            },
        })
    }

    async fn power_on(&self) -> Result<(), Fault> {
        self.update(|state| {
            if state.power == PowerState::PoweredOn {
                return Err(Fault::InvalidPowerState {
                    existing: state.power,
                });
            }
            state.power = PowerState::PoweredOn;
            state.boot_time = Some(Utc::now());
            state.version += 1;

            let ids: Vec<String> = state.exec_config.sessions.keys().cloned().collect();
            for id in &ids {
                state.published.remove(&session_started_key(id));
            }

            if let Some(detail) = state.guest.start_detail.clone() {
                let now = Utc::now().timestamp();
                for session in state.exec_config.sessions.values_mut() {
                    session.started = detail.clone();
                    session.start_time = now;
                }
                for id in ids {
                    state.published.insert(session_started_key(&id), detail.clone());
                }
                state.version += 1;
            }
            Ok(())
        })
    }

    async fn power_off(&self) -> Result<(), Fault> {
        self.update(|state| {
            if let Some(fault) = state.guest.power_off_fault.clone() {
                if state.guest.shutdown_during_power_off && state.power == PowerState::PoweredOn {
                    state.power_off(0);
                    // Publish the concurrent shutdown even though the task faulted.
                    return Ok(Err(fault));
                }
                return Ok(Err(fault));
            }
            if state.power == PowerState::PoweredOff {
                return Err(Fault::InvalidPowerState {
                    existing: state.power,
                });
            }
            state.power_off(137);
            Ok(Ok(()))
        })?
    }

    async fn wait_for_power_state(&self, target: PowerState) -> Result<(), Fault> {
        let mut rx = self.state.subscribe();
        let destroyed = rx
            .wait_for(|s| s.power == target || s.destroyed)
            .await
            .map_err(|_| Fault::NotFound(self.reference.clone()))?
            .destroyed;
        if destroyed {
            return Err(Fault::NotFound(self.reference.clone()));
        }
        Ok(())
    }

    async fn start_guest_program(
        &self,
        auth: &GuestAuth,
        spec: &GuestProgramSpec,
    ) -> Result<i64, Fault> {
        debug!(vm = %self.reference, user = %auth.username, program = %spec.program_path, args = %spec.arguments, "guest program");
        self.update(|state| {
            if state.power != PowerState::PoweredOn {
                return Err(Fault::InvalidPowerState {
                    existing: state.power,
                });
            }
            if let Some(fault) = state.guest.guest_program_fault.clone() {
                return Err(fault);
            }
            state.programs.push(spec.clone());
            let pid = state.programs.len() as i64;

            if spec.program_path == GUEST_KILL_PROGRAM {
                if let Ok(signal) = spec.arguments.parse::<Signal>() {
                    if state.guest.exits_on.contains(&signal) {
                        state.power_off(128 + signal.as_i32());
                    }
                }
            }
            Ok(pid)
        })
    }

    async fn wait_for_key(&self, key: &str) -> Result<String, Fault> {
        let mut rx = self.state.subscribe();
        let value = rx
            .wait_for(|s| s.published.contains_key(key) || s.destroyed)
            .await
            .map_err(|_| Fault::NotFound(self.reference.clone()))?
            .published
            .get(key)
            .cloned();
        value.ok_or_else(|| Fault::NotFound(self.reference.clone()))
    }

    async fn reconfigure(
        &self,
        expected_version: &str,
        exec_config: &ExecutorConfig,
    ) -> Result<(), Fault> {
        self.update(|state| {
            if state.version.to_string() != expected_version {
                return Err(Fault::ConcurrentAccess);
            }
            state.exec_config = exec_config.clone();
            state.version += 1;
            Ok(())
        })
    }

    async fn destroy(&self) -> Result<(), Fault> {
        self.update(|state| {
            if state.power == PowerState::PoweredOn {
                return Err(Fault::InvalidPowerState {
                    existing: state.power,
                });
            }
            state.destroyed = true;
            Ok(())
        })
    }

    async fn read_log(&self) -> Result<Vec<u8>, Fault> {
        let state = self.state.borrow();
        if state.destroyed {
            return Err(Fault::NotFound(self.reference.clone()));
        }
        Ok(state.log.clone())
    }

    async fn follow_log(&self, offset: u64) -> Result<LogStream, Fault> {
        let rx = self.state.subscribe();
        let stream = futures::stream::unfold((rx, offset), |(mut rx, offset)| async move {
            loop {
                let (chunk, running) = {
                    let state = rx.borrow_and_update();
                    let start = usize::try_from(offset).unwrap_or(usize::MAX);
                    let chunk = state
                        .log
                        .get(start..)
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default();
                    (chunk, state.power == PowerState::PoweredOn && !state.destroyed)
                };
                if !chunk.is_empty() {
                    let next = offset + chunk.len() as u64;
                    return Some((Ok::<Bytes, io::Error>(chunk), (rx, next)));
                }
                if !running || rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(StreamReader::new(Box::pin(stream))))
    }
}

// =============================================================================
// MemoryBackend
// =============================================================================

/// Backend whose VMs live in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    vms: RwLock<HashMap<String, Arc<MemoryVm>>>,
    guest: RwLock<GuestBehavior>,
    next_ref: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose new VMs start with `guest` behavior.
    #[must_use]
    pub fn with_guest(guest: GuestBehavior) -> Self {
        Self {
            guest: RwLock::new(guest),
            ..Self::default()
        }
    }

    /// The VM of container `id`, including destroyed ones.
    #[must_use]
    pub fn vm(&self, id: &str) -> Option<Arc<MemoryVm>> {
        self.vms.read().ok()?.get(id).cloned()
    }

    /// Number of live VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vms
            .read()
            .map(|vms| vms.values().filter(|vm| !vm.is_destroyed()).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<Arc<dyn VirtualMachine>, Fault> {
        let id = spec.exec_config.id.clone();
        let guest = self
            .guest
            .read()
            .map(|g| g.clone())
            .map_err(|_| Fault::Unavailable("guest behavior lock poisoned".into()))?;

        let mut vms = self
            .vms
            .write()
            .map_err(|_| Fault::Unavailable("vm table lock poisoned".into()))?;
        if vms.get(&id).is_some_and(|vm| !vm.is_destroyed()) {
            return Err(Fault::Other(format!("vm for {id} already exists")));
        }

        let reference = format!("vm-{}", self.next_ref.fetch_add(1, Ordering::Relaxed) + 1);
        let vm = Arc::new(MemoryVm::new(reference, spec.exec_config.clone(), guest));
        vms.insert(id, vm.clone());
        Ok(vm)
    }

    async fn find_vm(&self, id: &str) -> Result<Option<Arc<dyn VirtualMachine>>, Fault> {
        let vms = self
            .vms
            .read()
            .map_err(|_| Fault::Unavailable("vm table lock poisoned".into()))?;
        Ok(vms
            .get(id)
            .filter(|vm| !vm.is_destroyed())
            .map(|vm| vm.clone() as Arc<dyn VirtualMachine>))
    }
}
