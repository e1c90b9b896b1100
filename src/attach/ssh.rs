//! SSH session layer.
//!
//! The host is the SSH *client* on a connection the guest dialled. It logs in
//! as [`BACKCHANNEL_USER`] with `none` authentication and accepts any host
//! key: the stream is already private to one VM. Each attachable process is
//! a session channel opened with an exec request:
//!
//! | Request          | Reply                                   |
//! |------------------|-----------------------------------------|
//! | `container-ids`  | whitespace-separated ids, then EOF      |
//! | `attach <id>`    | the process's stdio on this channel     |

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Sig};
use tracing::{debug, info, warn};

use super::listener::BoxedStream;
use super::session::{
    Backchannel, PumpEnd, PumpSession, SessionCommand, SessionInteraction, SessionProtocol,
};
use crate::constants::{
    validate_session_id, ATTACH_REQUEST, BACKCHANNEL_USER, LIST_IDS_REQUEST,
    MAX_SESSIONS_PER_BACKCHANNEL, SESSION_BUFFER,
};
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::trace::Operation;

/// Client handler; the backchannel is trusted by construction.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`SessionProtocol`] speaking SSH as the client.
pub struct SshProtocol {
    config: Arc<client::Config>,
    debug: bool,
}

impl std::fmt::Debug for SshProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshProtocol")
            .field("debug", &self.debug)
            .finish()
    }
}

impl SshProtocol {
    #[must_use]
    pub fn new(debug: bool) -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            debug,
        }
    }
}

impl Default for SshProtocol {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl SessionProtocol for SshProtocol {
    async fn establish(
        &self,
        op: &Operation,
        stream: BoxedStream,
    ) -> Result<Box<dyn Backchannel>> {
        debug!(op = %op.id(), "initiating ssh handshake with new connection");

        let connect = client::connect_stream(self.config.clone(), stream, ClientHandler);
        let mut handle = op
            .bounded(connect)
            .await
            .map_err(|cause| Error::Cancelled {
                operation: "ssh connect".into(),
                cause,
            })?
            .map_err(|e| Error::Session(format!("SSH connection could not be established: {e}")))?;

        let accepted = op
            .bounded(handle.authenticate_none(BACKCHANNEL_USER))
            .await
            .map_err(|cause| Error::Cancelled {
                operation: "ssh auth".into(),
                cause,
            })?
            .map_err(|e| Error::Session(format!("SSH authentication failed: {e}")))?;
        if !accepted {
            return Err(Error::Session(format!(
                "SSH authentication as {BACKCHANNEL_USER} rejected"
            )));
        }

        Ok(Box::new(SshBackchannel {
            handle,
            debug: self.debug,
        }))
    }
}

/// Authenticated SSH client connection.
pub struct SshBackchannel {
    handle: client::Handle<ClientHandler>,
    debug: bool,
}

impl SshBackchannel {
    async fn open(&self, op: &Operation, command: &str) -> Result<Channel<Msg>> {
        let channel = op
            .bounded(self.handle.channel_open_session())
            .await
            .map_err(|cause| Error::Cancelled {
                operation: command.to_string(),
                cause,
            })?
            .map_err(|e| Error::Session(format!("failed to open channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Session(format!("{command}: {e}")))?;
        Ok(channel)
    }
}

#[async_trait]
impl Backchannel for SshBackchannel {
    async fn ids(&self, op: &Operation) -> Result<Vec<String>> {
        let mut channel = self.open(op, LIST_IDS_REQUEST).await?;
        let mut raw = Vec::new();

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => raw.extend_from_slice(&data),
                    ChannelMsg::Failure => {
                        return Err(Error::Session(format!("{LIST_IDS_REQUEST} rejected")));
                    }
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
            Ok(())
        };
        op.bounded(collect)
            .await
            .map_err(|cause| Error::Cancelled {
                operation: LIST_IDS_REQUEST.into(),
                cause,
            })??;

        parse_ids(&String::from_utf8_lossy(&raw))
    }

    async fn attach(&self, op: &Operation, id: &str) -> Result<Arc<dyn SessionInteraction>> {
        validate_session_id(id).map_err(|reason| Error::InvalidInput(format!("{id}: {reason}")))?;
        let channel = self.open(op, &format!("{ATTACH_REQUEST} {id}")).await?;

        let (session, end) = PumpSession::channel(id, SESSION_BUFFER);
        tokio::spawn(pump(id.to_string(), channel, end, self.debug));
        info!(op = %op.id(), id = %id, "attached to session");
        Ok(Arc::new(session))
    }
}

/// Ids from a `container-ids` reply, validated, de-duplicated and capped.
fn parse_ids(reply: &str) -> Result<Vec<String>> {
    let mut ids = BTreeSet::new();
    for id in reply.split_whitespace() {
        validate_session_id(id)
            .map_err(|reason| Error::Session(format!("guest offered bad id {id:?}: {reason}")))?;
        ids.insert(id.to_string());
    }
    if ids.len() > MAX_SESSIONS_PER_BACKCHANNEL {
        return Err(Error::Session(format!(
            "guest offered {} sessions (max {MAX_SESSIONS_PER_BACKCHANNEL})",
            ids.len()
        )));
    }
    Ok(ids.into_iter().collect())
}

fn ssh_signal(signal: Signal) -> Sig {
    match signal {
        Signal::Term => Sig::TERM,
        Signal::Kill => Sig::KILL,
        Signal::Hup => Sig::HUP,
        Signal::Int => Sig::INT,
        Signal::Quit => Sig::QUIT,
        Signal::Usr1 => Sig::USR1,
        Signal::Usr2 => Sig::Custom(signal.name().to_string()),
    }
}

enum Event {
    Remote(Option<ChannelMsg>),
    Local(Option<SessionCommand>),
}

/// Moves bytes between one SSH channel and its [`PumpSession`].
async fn pump(id: String, mut channel: Channel<Msg>, mut end: PumpEnd, verbose: bool) {
    loop {
        let event = tokio::select! {
            msg = channel.wait() => Event::Remote(msg),
            cmd = end.commands.recv() => Event::Local(cmd),
        };

        match event {
            Event::Remote(Some(ChannelMsg::Data { data }))
            | Event::Remote(Some(ChannelMsg::ExtendedData { data, .. })) => {
                if verbose {
                    debug!(id = %id, bytes = data.len(), "session output");
                }
                if end.output.send(Bytes::copy_from_slice(&data)).await.is_err() {
                    break;
                }
            }
            Event::Remote(Some(ChannelMsg::Failure)) => {
                warn!(id = %id, "attach request rejected by guest");
                break;
            }
            Event::Remote(Some(ChannelMsg::ExitStatus { exit_status })) => {
                debug!(id = %id, exit_status, "session exited");
            }
            Event::Remote(Some(ChannelMsg::Eof | ChannelMsg::Close) | None) => break,
            Event::Remote(Some(_)) => {}
            Event::Local(Some(SessionCommand::Data(bytes))) => {
                if let Err(e) = channel.data(&bytes[..]).await {
                    warn!(id = %id, "session write failed: {e}");
                    break;
                }
            }
            Event::Local(Some(SessionCommand::Signal(signal))) => {
                if let Err(e) = channel.signal(ssh_signal(signal)).await {
                    warn!(id = %id, signal = %signal, "session signal failed: {e}");
                }
            }
            Event::Local(Some(SessionCommand::Resize { cols, rows })) => {
                if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                    warn!(id = %id, "session resize failed: {e}");
                }
            }
            Event::Local(Some(SessionCommand::Close) | None) => {
                let _ = channel.eof().await;
                let _ = channel.close().await;
                break;
            }
        }
    }
    debug!(id = %id, "session pump finished");
}
