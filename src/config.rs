//! Daemon configuration.
//!
//! Defaults come from [`crate::constants`]. A JSON file may override any
//! subset, and [`Overrides`] (command-line flags, each backed by a
//! `MAGIKCELL_*` environment variable) override the file:
//!
//! ```text
//!   Config::default()  ◄─  from_file(path)  ◄─  apply(&Overrides)  ──►  validate()
//! ```
//!
//! | Flag                            | Variable                                | Field                         |
//! |---------------------------------|-----------------------------------------|-------------------------------|
//! | `--listen`                      | `MAGIKCELL_ATTACH_ADDR`                 | `attach_addr`                 |
//! | `--debug`                       | `MAGIKCELL_DEBUG`                       | `debug`                       |
//! | `--log-level`                   | `MAGIKCELL_LOG_LEVEL`                   | `log_level`                   |
//! | `--handle-ttl-secs`             | `MAGIKCELL_HANDLE_TTL_SECS`             | `handle_ttl_secs`             |
//! | `--max-pending-handles`         | `MAGIKCELL_MAX_PENDING_HANDLES`         | `max_pending_handles`         |
//! | `--default-stop-wait-secs`      | `MAGIKCELL_DEFAULT_STOP_WAIT_SECS`      | `default_stop_wait_secs`      |
//! | `--start-report-timeout-secs`   | `MAGIKCELL_START_REPORT_TIMEOUT_SECS`   | `start_report_timeout_secs`   |
//! | `--container-wait-timeout-secs` | `MAGIKCELL_CONTAINER_WAIT_TIMEOUT_SECS` | `container_wait_timeout_secs` |
//! | `--handshake-timeout-ms`        | `MAGIKCELL_HANDSHAKE_TIMEOUT_MS`        | `handshake_timeout_ms`        |

use std::path::Path;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::ArgAction;
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONTAINER_WAIT_TIMEOUT, DEFAULT_ATTACH_ADDR, DEFAULT_STOP_WAIT, HANDLE_TTL,
    HANDSHAKE_TIMEOUT, MAX_PENDING_HANDLES, START_REPORT_TIMEOUT,
};
use crate::error::{Error, Result};

/// Upper bound on any configured wait, in seconds.
const MAX_WAIT_SECS: u64 = 60 * 60;

/// Upper bound on the pending handle cache.
const MAX_HANDLE_CAPACITY: usize = 100_000;

/// Log levels accepted by `log_level`.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attach connector listen address (`host:port`).
    pub attach_addr: String,
    /// Verbose logging of backchannel traffic.
    pub debug: bool,
    pub log_level: String,
    pub handle_ttl_secs: u64,
    pub max_pending_handles: usize,
    pub default_stop_wait_secs: u64,
    pub start_report_timeout_secs: u64,
    pub container_wait_timeout_secs: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attach_addr: DEFAULT_ATTACH_ADDR.to_string(),
            debug: false,
            log_level: "info".to_string(),
            handle_ttl_secs: HANDLE_TTL.as_secs(),
            max_pending_handles: MAX_PENDING_HANDLES,
            default_stop_wait_secs: DEFAULT_STOP_WAIT.as_secs(),
            start_report_timeout_secs: START_REPORT_TIMEOUT.as_secs(),
            container_wait_timeout_secs: CONTAINER_WAIT_TIMEOUT.as_secs(),
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    /// Loads a JSON file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Layers the set fields of `overrides` over `self`.
    #[must_use]
    pub fn apply(mut self, overrides: &Overrides) -> Self {
        if let Some(addr) = &overrides.attach_addr {
            self.attach_addr.clone_from(addr);
        }
        if let Some(level) = &overrides.log_level {
            self.log_level.clone_from(level);
        }
        self.debug |= overrides.debug;
        let numbers = [
            (&mut self.handle_ttl_secs, overrides.handle_ttl_secs),
            (&mut self.default_stop_wait_secs, overrides.default_stop_wait_secs),
            (&mut self.start_report_timeout_secs, overrides.start_report_timeout_secs),
            (&mut self.container_wait_timeout_secs, overrides.container_wait_timeout_secs),
            (&mut self.handshake_timeout_ms, overrides.handshake_timeout_ms),
        ];
        for (field, value) in numbers {
            if let Some(value) = value {
                *field = value;
            }
        }
        if let Some(max) = overrides.max_pending_handles {
            self.max_pending_handles = max;
        }
        self
    }

    /// Rejects values outside their bounds.
    pub fn validate(&self) -> Result<()> {
        if self.attach_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Config(format!(
                "attach_addr must be host:port, got {:?}",
                self.attach_addr
            )));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(Error::Config(format!("unknown log level {:?}", self.log_level)));
        }
        if self.max_pending_handles == 0 || self.max_pending_handles > MAX_HANDLE_CAPACITY {
            return Err(Error::Config(format!(
                "max_pending_handles must be in 1..={MAX_HANDLE_CAPACITY}"
            )));
        }
        for (name, secs) in [
            ("handle_ttl_secs", self.handle_ttl_secs),
            ("default_stop_wait_secs", self.default_stop_wait_secs),
            ("start_report_timeout_secs", self.start_report_timeout_secs),
            ("container_wait_timeout_secs", self.container_wait_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_WAIT_SECS {
                return Err(Error::Config(format!("{name} must be in 1..={MAX_WAIT_SECS}")));
            }
        }
        if self.handshake_timeout_ms == 0 || self.handshake_timeout_ms > 10_000 {
            return Err(Error::Config(
                "handshake_timeout_ms must be in 1..=10000".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_secs)
    }

    #[must_use]
    pub fn default_stop_wait(&self) -> Duration {
        Duration::from_secs(self.default_stop_wait_secs)
    }

    #[must_use]
    pub fn start_report_timeout(&self) -> Duration {
        Duration::from_secs(self.start_report_timeout_secs)
    }

    #[must_use]
    pub fn container_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.container_wait_timeout_secs)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Command-line overrides, each also read from its `MAGIKCELL_*` variable.
///
/// Flattened into the daemon's argument parser; unset fields leave the
/// loaded [`Config`] untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, clap::Args)]
pub struct Overrides {
    /// Attach listen address (host:port).
    #[arg(long = "listen", env = "MAGIKCELL_ATTACH_ADDR")]
    pub attach_addr: Option<String>,

    /// Log backchannel traffic.
    #[arg(
        long,
        env = "MAGIKCELL_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MAGIKCELL_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "MAGIKCELL_HANDLE_TTL_SECS")]
    pub handle_ttl_secs: Option<u64>,

    #[arg(long, env = "MAGIKCELL_MAX_PENDING_HANDLES")]
    pub max_pending_handles: Option<usize>,

    /// Per-signal wait when stopping a container.
    #[arg(long, env = "MAGIKCELL_DEFAULT_STOP_WAIT_SECS")]
    pub default_stop_wait_secs: Option<u64>,

    #[arg(long, env = "MAGIKCELL_START_REPORT_TIMEOUT_SECS")]
    pub start_report_timeout_secs: Option<u64>,

    #[arg(long, env = "MAGIKCELL_CONTAINER_WAIT_TIMEOUT_SECS")]
    pub container_wait_timeout_secs: Option<u64>,

    #[arg(long, env = "MAGIKCELL_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: Option<u64>,
}
