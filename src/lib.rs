//! # magikcell
//!
//! **One VM per container: staged lifecycle commits and attach backchannels**
//!
//! This crate manages containers that each run in their own virtual machine
//! on a shared, slow-to-query virtualization backend. It provides two
//! independent subsystems:
//!
//! - [`exec`]: a Handle/Commit protocol that turns independent API calls into
//!   atomic, optimistically concurrent state transitions of a remote VM,
//!   including escalating graceful shutdown.
//! - [`attach`]: a connector that accepts backchannels dialled by running
//!   containers, aligns and authenticates them, and publishes one interactive
//!   session per attachable process.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             magikcell                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────┐   ┌────────────────────────────┐  │
//! │  │            Exec              │   │         Connector          │  │
//! │  │  create / get_handle / stash │   │  get(id, timeout) / remove │  │
//! │  │  Handle ──commit──► registry │   │  accept → handshake → SSH  │  │
//! │  └──────────────┬───────────────┘   └─────────────┬──────────────┘  │
//! │                 │                                 │                 │
//! │  ┌──────────────▼───────────────┐   ┌─────────────▼──────────────┐  │
//! │  │  Backend / VirtualMachine    │   │  Listener (TCP / vsock)    │  │
//! │  │  power, guest programs,      │   │  SessionProtocol (russh)   │  │
//! │  │  guestinfo keys, reconfigure │   │                            │  │
//! │  └──────────────────────────────┘   └────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐  commit(create)  ┌─────────┐  start  ┌─────────┐  stop  ┌─────────┐
//!   │ (none)  │ ───────────────► │ Created │ ──────► │ Running │ ─────► │ Stopped │
//!   └─────────┘                  └─────────┘         └─────────┘        └────┬────┘
//!                                                         ▲      start       │
//!                                                         └──────────────────┘
//! ```
//!
//! # Concurrency Model
//!
//! - Handles are owned values; nothing else sees staged changes.
//! - A commit succeeds only from the current backend version, and only one
//!   commit may consume a given base version ([`exec::gate`]).
//! - No lock is held across a backend round trip.
//! - Every wait takes a [`trace::Operation`] carrying cancellation and a
//!   deadline.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikcell::{Config, Exec, Operation, State};
//! use magikcell::backend::memory::MemoryBackend;
//!
//! let exec = Exec::new(Arc::new(MemoryBackend::new()), &Config::default());
//! let op = Operation::new("run container");
//! let mut handle = exec.create(&op, create_config)?;
//! handle.set_target_state(State::Running);
//! handle.commit(&op, &exec, None).await?;
//! ```

pub mod attach;
pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod exec;
pub mod executor;
pub mod signal;
pub mod trace;

// Re-exports
pub use attach::{Connector, SessionInteraction, SshProtocol, TcpListener};
pub use backend::{Backend, Fault, PowerState, VirtualMachine};
pub use config::Config;
pub use error::{Error, Result};
pub use exec::{Container, ContainerCache, Exec, Handle, State};
pub use executor::{CreateConfig, ExecutorConfig, SessionConfig};
pub use signal::Signal;
pub use trace::{Cause, Operation};
