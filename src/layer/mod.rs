//! Stream Layer Module
//!
//! The socket layer the connection manager sits on top of. A layer accepts
//! inbound connections, dials outbound ones, and can be closed to stop
//! accepting. Framing and multiplexing live below this seam.

pub mod memory;
pub mod tcp;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub use memory::{ConnProbe, MemoryConn, MemoryLayer};
pub use tcp::TcpLayer;

/// A raw bidirectional connection produced by a [`StreamLayer`].
#[async_trait]
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the remote end. Outbound pools are keyed by its string form.
    fn remote_addr(&self) -> io::Result<SocketAddr>;

    /// Gracefully close the write half and release the connection.
    async fn close(mut self) -> io::Result<()>
    where
        Self: Sized,
    {
        self.shutdown().await
    }
}

/// Accept/dial/close capability set required from the underlying transport.
#[async_trait]
pub trait StreamLayer: Send + Sync + 'static {
    type Conn: Connection;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Open a connection to `host`, giving up after `timeout`.
    async fn dial(&self, host: &str, timeout: Duration) -> io::Result<Self::Conn>;

    /// Stop accepting and release the listening resource.
    fn close(&self) -> io::Result<()>;
}

/// Per-connection callback invoked for every accepted connection.
///
/// Returning (with or without an error) ends the connection's lifetime.
#[async_trait]
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    async fn handle(&self, conn: C) -> crate::Result<()>;
}

#[async_trait]
impl<C, F, Fut> ConnectionHandler<C> for F
where
    C: Send + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    async fn handle(&self, conn: C) -> crate::Result<()> {
        (self)(conn).await
    }
}

impl Connection for TcpStream {
    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr()
    }
}
