//! Attach connector.
//!
//! Running containers dial the host; the connector accepts those
//! backchannels, handshakes them, builds the session layer on top, and
//! publishes one [`SessionInteraction`] per offered id. Callers look sessions
//! up by id, optionally waiting for one to appear.
//!
//! ```text
//!   Listener ──accept──► process_incoming (task per stream)
//!                           │ purge + handshake (retry ≤ N)
//!                           │ SessionProtocol::establish
//!                           │ ids() → attach(id) → insert + notify_waiters()
//!                           ▼
//!   get(id, timeout) ◄── Mutex<HashMap<id, Connection>> + Notify
//! ```
//!
//! Waiters use a broadcast-then-recheck loop: each round registers for the
//! next broadcast *before* re-checking the map, so an insert between the check
//! and the wait is never missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handshake::{self, HandshakeError};
use super::listener::{BoxedStream, Listener};
use super::session::{Backchannel, SessionInteraction, SessionProtocol};
use crate::config::Config;
use crate::constants::{HANDSHAKE_MAX_ATTEMPTS, HANDSHAKE_TIMEOUT, PURGE_QUIET_PERIOD};
use crate::error::{Error, Result};
use crate::trace::Operation;

/// Published session for one id.
#[derive(Clone)]
struct Connection {
    session: Arc<dyn SessionInteraction>,
    // Keeps the session layer alive while any of its sessions is published.
    _backchannel: Arc<dyn Backchannel>,
}

struct Shared {
    connections: Mutex<HashMap<String, Connection>>,
    notify: Notify,
    protocol: Arc<dyn SessionProtocol>,
    debug: bool,
    handshake_timeout: Duration,
}

impl Shared {
    fn lookup(&self, id: &str) -> Option<Arc<dyn SessionInteraction>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|c| c.session.clone())
    }

    /// Publishes `connection` under `id`, returning the session it replaced.
    fn insert(&self, id: &str, connection: Connection) -> Option<Arc<dyn SessionInteraction>> {
        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), connection);
        self.notify.notify_waiters();
        previous.map(|c| c.session)
    }
}

/// Backchannel connector.
pub struct Connector {
    shared: Arc<Shared>,
    listener: Arc<dyn Listener>,
    shutdown: CancellationToken,
    serve: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("url", &self.listener.url())
            .field("ids", &self.ids())
            .finish()
    }
}

impl Connector {
    /// Starts accepting on `listener`. Must be called within a Tokio runtime.
    pub fn new(
        listener: Arc<dyn Listener>,
        protocol: Arc<dyn SessionProtocol>,
        debug: bool,
    ) -> Self {
        Self::start(listener, protocol, debug, HANDSHAKE_TIMEOUT)
    }

    /// Like [`Connector::new`], with the debug flag and handshake timeout
    /// taken from `config`.
    pub fn from_config(
        listener: Arc<dyn Listener>,
        protocol: Arc<dyn SessionProtocol>,
        config: &Config,
    ) -> Self {
        Self::start(listener, protocol, config.debug, config.handshake_timeout())
    }

    fn start(
        listener: Arc<dyn Listener>,
        protocol: Arc<dyn SessionProtocol>,
        debug: bool,
        handshake_timeout: Duration,
    ) -> Self {
        let op = Operation::new("attach connector");
        let _t = op.begin("new backchannel connector");

        let shared = Arc::new(Shared {
            connections: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            protocol,
            debug,
            handshake_timeout,
        });
        let shutdown = CancellationToken::new();
        let serve = tokio::spawn(serve(
            op,
            shared.clone(),
            listener.clone(),
            shutdown.clone(),
        ));

        Self {
            shared,
            listener,
            shutdown,
            serve: tokio::sync::Mutex::new(Some(serve)),
        }
    }

    /// Session for `id`.
    ///
    /// A zero `timeout` never blocks. Otherwise waits until a session for `id`
    /// is published, `timeout` passes, or `op` is cancelled.
    pub async fn get(
        &self,
        op: &Operation,
        id: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn SessionInteraction>> {
        let _t = op.begin(format!("acquire connection with {id}"));

        if let Some(session) = self.shared.lookup(id) {
            return Ok(session);
        }
        if timeout.is_zero() {
            return Err(Error::NoSuchConnection(id.to_string()));
        }

        let wait = op.with_timeout(timeout);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.shared.lookup(id) {
                debug!(op = %op.id(), id = %id, "found connection");
                return Ok(session);
            }
            info!(op = %op.id(), id = %id, "connection not found yet");

            tokio::select! {
                () = &mut notified => {}
                cause = wait.done() => {
                    let err = Error::ConnectionNotFound { id: id.to_string(), cause };
                    error!(op = %op.id(), "{err}");
                    return Err(err);
                }
            }
        }
    }

    /// Closes and unpublishes the session for `id`; no-op if absent.
    pub async fn remove(&self, op: &Operation, id: &str) -> Result<()> {
        let _t = op.begin(format!("remove connection: {id}"));
        let removed = self
            .shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(connection) => connection.session.close().await,
            None => Ok(()),
        }
    }

    /// Stops accepting. Connections already accepted keep being processed.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.serve.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("attach connector: accept loop ended abnormally: {e}");
            }
        }
    }

    /// Address containers dial.
    #[must_use]
    pub fn url(&self) -> String {
        self.listener.url()
    }

    /// Ids with a published session, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Accept loop
// =============================================================================

async fn serve(
    op: Operation,
    shared: Arc<Shared>,
    listener: Arc<dyn Listener>,
    shutdown: CancellationToken,
) {
    info!(op = %op.id(), url = %listener.url(), "attach connector listening");
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                let conn_op = op.child("new incoming connection");
                debug!(op = %conn_op.id(), peer = %peer, "accepted backchannel");
                tokio::spawn(process_incoming(conn_op, shared.clone(), stream));
            }
            Err(e) => {
                error!(op = %op.id(), "error waiting for incoming connection: {e}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!(op = %op.id(), "attach connector: serve exiting");
}

/// Handshakes one accepted stream and publishes its sessions.
async fn process_incoming(op: Operation, shared: Arc<Shared>, mut stream: BoxedStream) {
    let _t = op.begin("process incoming connection");

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Err(e) = handshake::purge(&mut stream, PURGE_QUIET_PERIOD).await {
            error!(op = %op.id(), "purge failed: {e}");
            return;
        }
        match handshake::handshake(&mut stream, shared.handshake_timeout, shared.debug).await {
            Ok(()) => {
                debug!(op = %op.id(), attempts, "attach connector: new connection");
                break;
            }
            Err(HandshakeError::Eof) => {
                debug!(op = %op.id(), "caught EOF");
                return;
            }
            Err(e) if e.is_retryable() && attempts < HANDSHAKE_MAX_ATTEMPTS => {
                if shared.debug {
                    debug!(op = %op.id(), attempts, "handshake retry: {e}");
                }
            }
            Err(e) => {
                error!(op = %op.id(), attempts, "handshake failed: {e}");
                return;
            }
        }
    }

    let backchannel: Arc<dyn Backchannel> = match shared.protocol.establish(&op, stream).await {
        Ok(backchannel) => Arc::from(backchannel),
        Err(e) => {
            error!(op = %op.id(), "session layer could not be established: {e}");
            return;
        }
    };

    let ids = match backchannel.ids(&op).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(op = %op.id(), "listing sessions failed: {e}");
            return;
        }
    };

    for id in ids {
        let session = match backchannel.attach(&op, &id).await {
            Ok(session) => session,
            Err(e) => {
                error!(op = %op.id(), id = %id, "attach failed: {e}");
                return;
            }
        };
        info!(op = %op.id(), id = %id, "established connection with container VM");

        let connection = Connection {
            session,
            _backchannel: backchannel.clone(),
        };
        if let Some(previous) = shared.insert(&id, connection) {
            debug!(op = %op.id(), id = %id, "replaced stale connection");
            if let Err(e) = previous.close().await {
                warn!(op = %op.id(), id = %id, "closing stale connection failed: {e}");
            }
        }
    }
}
