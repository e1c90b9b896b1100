//! # Virtualization Backend Capability
//!
//! The lifecycle layer drives VMs through two object-safe traits:
//!
//! - [`Backend`]: creates and finds VMs (one per container)
//! - [`VirtualMachine`]: power control, property snapshots, guest program
//!   execution, guest-to-host key publication, reconfiguration, logs
//!
//! Implementations are opaque drivers. None of the calls are bounded
//! internally: callers bound every wait with [`crate::trace::Operation`], and
//! dropping a pending future must release whatever the driver was waiting on.
//!
//! ## Fault Policy
//!
//! Some backend faults are expected races rather than failures (a power-off
//! that finds the VM already off). Which faults are absorbed is decided by a
//! single table, [`FAULT_POLICY`], consulted through [`classify`].
//!
//! ## Implementations
//!
//! - [`memory::MemoryBackend`]: in-process VMs with a simulated guest

pub mod memory;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::constants::VM_NOT_SUSPENDED_KEY;
use crate::executor::ExecutorConfig;

// =============================================================================
// Snapshots
// =============================================================================

/// Power state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOff,
    PoweredOn,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::PoweredOn => write!(f, "poweredOn"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Configuration half of a property snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Opaque token that advances on every applied mutation.
    pub change_version: String,
    /// Decoded container configuration stored with the VM.
    pub exec_config: ExecutorConfig,
}

/// Runtime half of a property snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRuntime {
    pub power_state: PowerState,
    pub boot_time: Option<DateTime<Utc>>,
}

/// A consistent `{config, runtime}` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub config: VmConfig,
    pub runtime: VmRuntime,
}

/// What to create for a new container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub image: String,
    pub exec_config: ExecutorConfig,
}

impl VmSpec {
    /// Creation spec for a container's configuration.
    #[must_use]
    pub fn for_container(exec_config: &ExecutorConfig) -> Self {
        Self {
            name: exec_config.id.clone(),
            image: exec_config.layer_id.clone(),
            exec_config: exec_config.clone(),
        }
    }
}

/// Program to run inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProgramSpec {
    pub program_path: String,
    pub arguments: String,
}

/// Principal used to authenticate guest program execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestAuth {
    pub username: String,
}

/// Detail attached to some faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultMessage {
    pub key: String,
    pub message: String,
}

/// Readable log stream returned by the backend.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

// =============================================================================
// Faults
// =============================================================================

/// Fault reported by a backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    /// The operation is not valid in the VM's current power state.
    #[error("invalid power state (existing state: {existing})")]
    InvalidPowerState { existing: PowerState },

    /// Catch-all configuration fault with keyed messages.
    #[error("generic vm config fault: {}", join_messages(.messages))]
    GenericVmConfig { messages: Vec<FaultMessage> },

    /// A conditional update lost against a concurrent change.
    #[error("concurrent access: the object was modified since it was read")]
    ConcurrentAccess,

    /// The managed object does not exist.
    #[error("managed object not found: {0}")]
    NotFound(String),

    /// The backend cannot be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend gave up waiting on a task.
    #[error("backend task timed out")]
    Timeout,

    /// Anything else, with the backend's detail string.
    #[error("{0}")]
    Other(String),
}

fn join_messages(messages: &[FaultMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{} ({})", m.message, m.key))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Backend call a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PowerOn,
    PowerOff,
    Reconfigure,
    Destroy,
    GuestProgram,
}

/// How a fault is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Expected race; treated as success.
    Benign,
    /// Lost a race the caller must retry with fresh state.
    Retry,
    /// Reported to the caller.
    Fatal,
}

/// One entry of the fault policy table.
#[derive(Clone, Copy)]
pub struct FaultRule {
    pub action: Action,
    pub matches: fn(&Fault) -> bool,
    pub disposition: Disposition,
    pub reason: &'static str,
}

/// Fault policy, first match wins; unmatched faults are fatal.
pub const FAULT_POLICY: &[FaultRule] = &[
    FaultRule {
        action: Action::PowerOff,
        matches: already_powered_off,
        disposition: Disposition::Benign,
        reason: "state was already poweredOff",
    },
    FaultRule {
        action: Action::PowerOff,
        matches: cancelled_by_guest_shutdown,
        disposition: Disposition::Benign,
        reason: "power off task cancelled by concurrent guest shutdown",
    },
    FaultRule {
        action: Action::PowerOn,
        matches: already_powered_on,
        disposition: Disposition::Benign,
        reason: "state was already poweredOn",
    },
    FaultRule {
        action: Action::Reconfigure,
        matches: concurrent_access,
        disposition: Disposition::Retry,
        reason: "configuration changed concurrently",
    },
];

fn already_powered_off(fault: &Fault) -> bool {
    matches!(
        fault,
        Fault::InvalidPowerState {
            existing: PowerState::PoweredOff
        }
    )
}

fn already_powered_on(fault: &Fault) -> bool {
    matches!(
        fault,
        Fault::InvalidPowerState {
            existing: PowerState::PoweredOn
        }
    )
}

fn cancelled_by_guest_shutdown(fault: &Fault) -> bool {
    match fault {
        Fault::GenericVmConfig { messages } => messages
            .first()
            .is_some_and(|m| m.key == VM_NOT_SUSPENDED_KEY),
        _ => false,
    }
}

fn concurrent_access(fault: &Fault) -> bool {
    matches!(fault, Fault::ConcurrentAccess)
}

/// Classifies a fault raised by `action`, returning the matching rule's reason.
#[must_use]
pub fn classify(action: Action, fault: &Fault) -> (Disposition, &'static str) {
    FAULT_POLICY
        .iter()
        .find(|rule| rule.action == action && (rule.matches)(fault))
        .map_or((Disposition::Fatal, "unhandled fault"), |rule| {
            (rule.disposition, rule.reason)
        })
}

// =============================================================================
// Capability Traits
// =============================================================================

/// A container's VM on the backend.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Stable managed-object reference.
    fn reference(&self) -> &str;

    /// Fetches a consistent configuration and runtime snapshot.
    async fn properties(&self) -> Result<Properties, Fault>;

    async fn power_on(&self) -> Result<(), Fault>;

    async fn power_off(&self) -> Result<(), Fault>;

    /// Resolves once the VM reports `state`.
    async fn wait_for_power_state(&self, state: PowerState) -> Result<(), Fault>;

    /// Starts a program inside the guest, returning its process id.
    async fn start_guest_program(
        &self,
        auth: &GuestAuth,
        spec: &GuestProgramSpec,
    ) -> Result<i64, Fault>;

    /// Resolves with the value once the guest publishes `key`.
    async fn wait_for_key(&self, key: &str) -> Result<String, Fault>;

    /// Replaces the stored configuration if the VM is still at `expected_version`.
    async fn reconfigure(
        &self,
        expected_version: &str,
        exec_config: &ExecutorConfig,
    ) -> Result<(), Fault>;

    /// Deletes the VM and its storage.
    async fn destroy(&self) -> Result<(), Fault>;

    /// Returns the container's complete log so far.
    async fn read_log(&self) -> Result<Vec<u8>, Fault>;

    /// Streams the log from `offset`, following new output while the VM runs.
    async fn follow_log(&self, offset: u64) -> Result<LogStream, Fault>;
}

/// Session with a virtualization backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Creates a powered-off VM for a container.
    async fn create_vm(&self, spec: &VmSpec) -> Result<Arc<dyn VirtualMachine>, Fault>;

    /// Finds the VM of container `id`.
    async fn find_vm(&self, id: &str) -> Result<Option<Arc<dyn VirtualMachine>>, Fault>;
}
