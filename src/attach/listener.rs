//! Transport listeners for inbound backchannels.
//!
//! Containers reach the host either over TCP or, on Linux hosts, directly
//! over vsock. Both are erased behind [`Listener`] so the connector only sees
//! boxed byte streams.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream accepted from a container.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Waits for the next connection, returning it with a peer description.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;

    /// Address containers dial, as `scheme://address`.
    fn url(&self) -> String;
}

// =============================================================================
// TCP
// =============================================================================

/// TCP listener.
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    addr: SocketAddr,
}

impl TcpListener {
    /// Binds `addr`; port 0 picks a free port.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let addr = inner.local_addr()?;
        Ok(Self { inner, addr })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// =============================================================================
// vsock (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
pub use vsock::VsockListener;

#[cfg(target_os = "linux")]
mod vsock {
    use super::{BoxedStream, Listener};
    use async_trait::async_trait;
    use std::io;
    use tokio::sync::Mutex;
    use tokio_vsock::VsockAddr;

    /// vsock listener.
    pub struct VsockListener {
        inner: Mutex<tokio_vsock::VsockListener>,
        cid: u32,
        port: u32,
    }

    impl std::fmt::Debug for VsockListener {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("VsockListener")
                .field("cid", &self.cid)
                .field("port", &self.port)
                .finish()
        }
    }

    impl VsockListener {
        pub fn bind(cid: u32, port: u32) -> io::Result<Self> {
            let inner = tokio_vsock::VsockListener::bind(VsockAddr::new(cid, port))?;
            Ok(Self {
                inner: Mutex::new(inner),
                cid,
                port,
            })
        }
    }

    #[async_trait]
    impl Listener for VsockListener {
        async fn accept(&self) -> io::Result<(BoxedStream, String)> {
            let mut inner = self.inner.lock().await;
            let (stream, peer) = inner.accept().await?;
            Ok((Box::new(stream), format!("{}:{}", peer.cid(), peer.port())))
        }

        fn url(&self) -> String {
            format!("vsock://{}:{}", self.cid, self.port)
        }
    }
}
