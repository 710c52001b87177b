//! In-Memory Stream Layer
//!
//! Loopback-only layer backed by `tokio::io::duplex`. Dials to the layer's own
//! address land in its accept queue; anything else is refused.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Connection, StreamLayer};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConn {
    stream: DuplexStream,
    remote_addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

/// Observes whether a [`MemoryConn`] has been closed, after it has been moved away.
#[derive(Debug, Clone)]
pub struct ConnProbe(Arc<AtomicBool>);

impl ConnProbe {
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both probes observe the same connection.
    pub fn same_connection(&self, other: &ConnProbe) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl MemoryConn {
    fn new(stream: DuplexStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            remote_addr,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn probe(&self) -> ConnProbe {
        ConnProbe(Arc::clone(&self.closed))
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Connection for MemoryConn {
    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }
}

/// In-process [`StreamLayer`] for tests and socket-free embedding.
pub struct MemoryLayer {
    local_addr: SocketAddr,
    buffer_size: usize,
    incoming_tx: mpsc::UnboundedSender<MemoryConn>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<MemoryConn>>,
    closed: CancellationToken,
    dial_attempts: AtomicUsize,
    last_dial_timeout: std::sync::Mutex<Option<Duration>>,
    next_port: AtomicU16,
}

impl MemoryLayer {
    pub fn new(local_addr: SocketAddr) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            local_addr,
            buffer_size: DEFAULT_BUFFER_SIZE,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            closed: CancellationToken::new(),
            dial_attempts: AtomicUsize::new(0),
            last_dial_timeout: std::sync::Mutex::new(None),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of `dial` calls made so far, successful or not.
    pub fn dial_attempts(&self) -> usize {
        self.dial_attempts.load(Ordering::SeqCst)
    }

    /// Timeout passed to the most recent `dial`.
    pub fn last_dial_timeout(&self) -> Option<Duration> {
        *self
            .last_dial_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(self.local_addr.ip(), port)
    }
}

#[async_trait]
impl StreamLayer for MemoryLayer {
    type Conn = MemoryConn;

    async fn accept(&self) -> io::Result<MemoryConn> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "memory layer closed"))
            }
            conn = incoming.recv() => {
                conn.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "accept queue gone"))
            }
        }
    }

    async fn dial(&self, host: &str, timeout: Duration) -> io::Result<MemoryConn> {
        self.dial_attempts.fetch_add(1, Ordering::SeqCst);
        *self
            .last_dial_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(timeout);

        let target: SocketAddr = host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", host, e)))?;
        if target != self.local_addr || self.closed.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}", host),
            ));
        }

        let (client, server) = tokio::io::duplex(self.buffer_size);
        let server = MemoryConn::new(server, self.ephemeral_addr());
        self.incoming_tx
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "accept queue gone"))?;

        Ok(MemoryConn::new(client, target))
    }

    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
