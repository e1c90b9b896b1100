//! Backchannel handshake.
//!
//! Containers dial in over a byte stream that may carry leftovers from an
//! earlier boot or an abandoned attempt. Before the session layer starts,
//! the host purges stale input and runs a three-way handshake so both ends
//! agree where the session bytes begin.
//!
//! # Wire Format
//!
//! ```text
//! Host                                  Guest
//!   |  [SYN, seq]                         |
//!   |------------------------------------>|
//!   |  [SYN_ACK, seq+1, gseq]             |
//!   |<------------------------------------|
//!   |  [ACK, gseq+1]                      |
//!   |------------------------------------>|
//!   |         session bytes ...           |
//! ```
//!
//! Sequence numbers are single bytes and wrap. A host attempt is bounded by a
//! short timeout; on timeout or a misaligned reply the host purges and tries
//! again with a fresh sequence number. The guest answers every `SYN` it sees,
//! so a retried attempt re-synchronises both ends.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::constants::MAX_PURGE_BYTES;

/// Host opens an attempt.
pub const SYN: u8 = 0x16;
/// Guest answers an attempt.
pub const SYN_ACK: u8 = 0x17;
/// Host confirms the guest's sequence number.
pub const ACK: u8 = 0x06;

/// Handshake failure.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Peer closed the stream.
    #[error("connection closed by peer")]
    Eof,

    /// No complete reply within the attempt bound.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// Reply did not match the outstanding attempt.
    #[error("misaligned handshake: expected {expected:#04x?}, got {got:#04x?}")]
    Misaligned { expected: [u8; 2], got: [u8; 2] },

    #[error("handshake I/O error: {0}")]
    Io(#[source] io::Error),
}

impl HandshakeError {
    /// True if a fresh attempt on the same stream may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Misaligned { .. })
    }
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::Eof,
            _ => Self::Io(err),
        }
    }
}

/// Discards inbound bytes until the stream stays quiet for `quiet`.
///
/// Stops early at EOF (left for the handshake to report) or after
/// `MAX_PURGE_BYTES`. Returns the number of bytes discarded.
pub async fn purge<S>(stream: &mut S, quiet: Duration) -> io::Result<usize>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 1024];
    let mut purged = 0;
    while purged < MAX_PURGE_BYTES {
        match tokio::time::timeout(quiet, stream.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => purged += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    if purged > 0 {
        debug!(bytes = purged, "purged stale inbound bytes");
    }
    Ok(purged)
}

/// Host side of one handshake attempt, bounded by `timeout`.
pub async fn handshake<S>(
    stream: &mut S,
    timeout: Duration,
    verbose: bool,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let seq: u8 = rand::random();
    let attempt = async {
        stream.write_all(&[SYN, seq]).await?;
        stream.flush().await?;
        if verbose {
            trace!(seq, "sent SYN");
        }

        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await?;
        let expected = [SYN_ACK, seq.wrapping_add(1)];
        if reply[..2] != expected {
            return Err(HandshakeError::Misaligned {
                expected,
                got: [reply[0], reply[1]],
            });
        }

        let gseq = reply[2];
        stream.write_all(&[ACK, gseq.wrapping_add(1)]).await?;
        stream.flush().await?;
        if verbose {
            trace!(seq, gseq, "handshake complete");
        }
        Ok::<(), HandshakeError>(())
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

/// Guest side: answers `SYN`s until one is acknowledged.
///
/// Not bounded; callers wrap it in their own timeout.
pub async fn accept<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut pending: Option<u8> = None;
    loop {
        let seq = match pending.take() {
            Some(seq) => seq,
            None => {
                if stream.read_u8().await? != SYN {
                    continue;
                }
                stream.read_u8().await?
            }
        };

        let gseq: u8 = rand::random();
        stream
            .write_all(&[SYN_ACK, seq.wrapping_add(1), gseq])
            .await?;
        stream.flush().await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply == [ACK, gseq.wrapping_add(1)] {
            return Ok(());
        }
        // The host gave up on that attempt; a retried SYN starts over.
        if reply[0] == SYN {
            pending = Some(reply[1]);
        }
    }
}
