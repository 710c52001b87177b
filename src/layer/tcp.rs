//! TCP Stream Layer

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::StreamLayer;

/// Plain TCP implementation of [`StreamLayer`].
pub struct TcpLayer {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl TcpLayer {
    /// Bind a listener. Port 0 picks an ephemeral port; see [`TcpLayer::local_addr`].
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        info!("Binding TCP listener to {}", addr);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "listener closed")
    }
}

/// Drive `connect`, failing with `TimedOut` once `timeout` elapses.
async fn connect_within<T, F>(host: &str, timeout: Duration, connect: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(timeout, connect).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial to {} timed out after {:?}", host, timeout),
        )
    })?
}

#[async_trait]
impl StreamLayer for TcpLayer {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(Self::closed_error)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Self::closed_error()),
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                debug!("Accepted TCP connection from {}", addr);
                Ok(stream)
            }
        }
    }

    async fn dial(&self, host: &str, timeout: Duration) -> io::Result<TcpStream> {
        let stream = connect_within(host, timeout, TcpStream::connect(host)).await?;
        stream.set_nodelay(true)?;
        debug!("Dialed {} from {}", host, stream.local_addr()?);
        Ok(stream)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        if self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Closed TCP listener on {}", self.local_addr);
        }
        Ok(())
    }
}
