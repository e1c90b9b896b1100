//! Session capabilities.
//!
//! ```text
//!   SessionProtocol::establish(stream) ──► Backchannel ──ids()──► ["c1", "c2"]
//!                                              │
//!                                          attach("c1")
//!                                              ▼
//!                                      SessionInteraction
//! ```
//!
//! [`PumpSession`] is the channel-backed interaction shared by protocol
//! implementations: a pump task owns the real transport and exchanges
//! [`SessionCommand`]s and output chunks with it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::listener::BoxedStream;
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::trace::Operation;

/// Interactive access to one attached process.
#[async_trait]
pub trait SessionInteraction: fmt::Debug + Send + Sync {
    /// Writes to the process's stdin.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Next output chunk; `None` once the session has ended.
    async fn read(&self) -> Result<Option<Bytes>>;

    async fn signal(&self, signal: Signal) -> Result<()>;

    /// Resizes the process's terminal.
    async fn resize(&self, cols: u32, rows: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Established session layer over one backchannel.
#[async_trait]
pub trait Backchannel: Send + Sync {
    /// Ids of the sub-channels the guest offers.
    async fn ids(&self, op: &Operation) -> Result<Vec<String>>;

    /// Opens sub-channel `id`.
    async fn attach(&self, op: &Operation, id: &str) -> Result<Arc<dyn SessionInteraction>>;
}

/// Builds the session layer on a handshaken stream.
#[async_trait]
pub trait SessionProtocol: Send + Sync {
    async fn establish(&self, op: &Operation, stream: BoxedStream)
        -> Result<Box<dyn Backchannel>>;
}

// =============================================================================
// Channel-backed interaction
// =============================================================================

/// Request from a [`PumpSession`] to its pump task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Data(Bytes),
    Signal(Signal),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// Pump-side ends of a [`PumpSession`].
#[derive(Debug)]
pub struct PumpEnd {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub output: mpsc::Sender<Bytes>,
}

/// [`SessionInteraction`] that forwards to a pump task over channels.
#[derive(Debug)]
pub struct PumpSession {
    id: String,
    commands: mpsc::Sender<SessionCommand>,
    output: Mutex<mpsc::Receiver<Bytes>>,
}

impl PumpSession {
    /// Creates a session and the ends its pump task drives.
    #[must_use]
    pub fn channel(id: impl Into<String>, buffer: usize) -> (Self, PumpEnd) {
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: id.into(),
                commands: cmd_tx,
                output: Mutex::new(out_rx),
            },
            PumpEnd {
                commands: cmd_rx,
                output: out_tx,
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| Error::Session(format!("session {} is closed", self.id)))
    }
}

#[async_trait]
impl SessionInteraction for PumpSession {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.send(SessionCommand::Data(Bytes::copy_from_slice(data)))
            .await
    }

    async fn read(&self) -> Result<Option<Bytes>> {
        Ok(self.output.lock().await.recv().await)
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        self.send(SessionCommand::Signal(signal)).await
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.send(SessionCommand::Resize { cols, rows }).await
    }

    async fn close(&self) -> Result<()> {
        // Closing an already finished session is a no-op.
        let _ = self.commands.send(SessionCommand::Close).await;
        Ok(())
    }
}
