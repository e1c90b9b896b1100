//! # Attach Backchannel
//!
//! Interactive access to container processes over connections the
//! containers initiate.
//!
//! ## Layers
//!
//! | Module        | Responsibility                                    |
//! |---------------|---------------------------------------------------|
//! | [`listener`]  | TCP / vsock accept, erased to byte streams         |
//! | [`handshake`] | purge stale bytes, SYN / SYN_ACK / ACK alignment   |
//! | [`session`]   | session capability traits, channel-backed session  |
//! | [`ssh`]       | SSH client session layer (russh)                   |
//! | [`connector`] | accept loop, session registry, blocking lookup     |
//!
//! ## Example
//!
//! ```rust,ignore
//! let listener = Arc::new(TcpListener::bind("127.0.0.1:2377").await?);
//! let connector = Connector::new(listener, Arc::new(SshProtocol::new(false)), false);
//! let session = connector.get(&op, &id, Duration::from_secs(10)).await?;
//! session.write(b"ls\n").await?;
//! ```

pub mod connector;
pub mod handshake;
pub mod listener;
pub mod session;
pub mod ssh;

pub use connector::Connector;
pub use listener::{AsyncStream, BoxedStream, Listener, TcpListener};
pub use session::{Backchannel, PumpSession, SessionInteraction, SessionProtocol};
pub use ssh::SshProtocol;

#[cfg(target_os = "linux")]
pub use listener::VsockListener;
