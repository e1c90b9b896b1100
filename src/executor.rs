//! Container configuration as persisted alongside each VM.
//!
//! An [`ExecutorConfig`] describes everything the in-guest supervisor needs to
//! run a container: one or more sessions (the primary one shares the container
//! id), network endpoints, and creation metadata. The backend adapter decodes
//! it from the VM's property store; this crate only ever sees the decoded form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::signal::Signal;

/// Command line of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cmd {
    /// Executable path.
    pub path: String,
    /// Full argv, including the executable as `args[0]`.
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory.
    pub dir: String,
}

/// One process managed by the in-guest supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub id: String,
    pub name: String,
    pub cmd: Cmd,
    /// Allocate a TTY.
    pub tty: bool,
    /// Attach stdio through the backchannel.
    pub attach: bool,
    /// Whether the supervisor should launch this session.
    pub active: bool,
    /// First signal used by graceful shutdown (empty means TERM).
    pub stop_signal: String,
    /// Launch status published by the guest: `"true"` or an error detail.
    pub started: String,
    pub exit_status: i32,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds.
    pub stop_time: i64,
}

/// A network endpoint attached to the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEndpoint {
    pub name: String,
    /// Published ports, e.g. `8080:80/tcp`.
    pub ports: Vec<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    /// Number of times the supervisor restarted after a crash.
    pub resurrection_count: u32,
}

/// Declared configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub id: String,
    pub name: String,
    /// Unix seconds.
    pub create_time: i64,
    /// Version of the component that created the container.
    pub version: String,
    /// Persistent sessions, launched on every boot.
    pub sessions: BTreeMap<String, SessionConfig>,
    /// Ephemeral sessions, only valid for the current boot.
    pub execs: BTreeMap<String, SessionConfig>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
    pub annotations: BTreeMap<String, String>,
    pub layer_id: String,
    pub repo_name: String,
    pub diagnostics: Diagnostics,
}

impl ExecutorConfig {
    /// The session sharing the container id.
    #[must_use]
    pub fn primary_session(&self) -> Option<&SessionConfig> {
        self.sessions.get(&self.id)
    }

    /// True once the guest has reported a launch for any persistent session.
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.sessions.values().any(|s| !s.started.is_empty())
    }

    /// Ordered stop signals for graceful shutdown, always ending in KILL.
    #[must_use]
    pub fn stop_signals(&self) -> Vec<Signal> {
        let configured = self
            .primary_session()
            .map(|s| s.stop_signal.as_str())
            .unwrap_or_default();

        let first = if configured.is_empty() {
            Signal::Term
        } else {
            configured.parse().unwrap_or_else(|_| {
                warn!(id = %self.id, signal = %configured, "unknown stop signal, using TERM");
                Signal::Term
            })
        };

        if first == Signal::Kill {
            vec![Signal::Kill]
        } else {
            vec![first, Signal::Kill]
        }
    }
}

/// Caller-supplied parameters for a new container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub tty: bool,
    pub attach: bool,
    pub stop_signal: String,
    pub image: String,
    pub repo_name: String,
    pub annotations: BTreeMap<String, String>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
}

impl CreateConfig {
    /// Rejects configurations the supervisor could never run.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("container name cannot be empty".into()));
        }
        if self.path.is_empty() {
            return Err(Error::InvalidInput("command path cannot be empty".into()));
        }
        if !self.stop_signal.is_empty() {
            self.stop_signal.parse::<Signal>()?;
        }
        Ok(())
    }

    /// Builds the persisted configuration for container `id`.
    #[must_use]
    pub fn into_executor_config(self, id: &str) -> ExecutorConfig {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.path.clone());
        args.extend(self.args);

        let primary = SessionConfig {
            id: id.to_string(),
            name: self.name.clone(),
            cmd: Cmd {
                path: self.path,
                args,
                env: self.env,
                dir: self.working_dir,
            },
            tty: self.tty,
            attach: self.attach,
            active: true,
            stop_signal: self.stop_signal,
            ..Default::default()
        };

        let mut sessions = BTreeMap::new();
        sessions.insert(id.to_string(), primary);

        ExecutorConfig {
            id: id.to_string(),
            name: self.name,
            create_time: chrono::Utc::now().timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sessions,
            execs: BTreeMap::new(),
            networks: self.networks,
            annotations: self.annotations,
            layer_id: self.image,
            repo_name: self.repo_name,
            diagnostics: Diagnostics::default(),
        }
    }
}

/// Generates a new container id (32 lowercase hex characters).
#[must_use]
pub fn new_container_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
