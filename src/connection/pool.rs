//! Outbound Connection Pool
//!
//! Per-host stacks of idle outbound connections. The pool itself is plain
//! data; locking is the manager's job.

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// An outbound connection plus the time it was last returned to the pool.
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
    last_used: Instant,
}

impl<C> PooledConnection<C> {
    /// Wrap a freshly dialed connection; its use time is its creation time.
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            last_used: Instant::now(),
        }
    }

    /// Stamp the connection as used now.
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since the connection was last returned (or created).
    pub fn idle_time(&self) -> Duration {
        self.idle_time_at(Instant::now())
    }

    fn idle_time_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for PooledConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for PooledConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_shutdown(cx)
    }
}

/// Idle outbound connections keyed by remote address.
///
/// Each host's list is a stack: the most recently returned connection is
/// handed out first.
#[derive(Debug)]
pub(crate) struct HostPools<C> {
    hosts: HashMap<String, Vec<PooledConnection<C>>>,
}

impl<C> HostPools<C> {
    pub(crate) fn new() -> Self {
        Self {
            hosts: HashMap::new(),
        }
    }

    pub(crate) fn push(&mut self, host: String, conn: PooledConnection<C>) {
        self.hosts.entry(host).or_default().push(conn);
    }

    pub(crate) fn pop(&mut self, host: &str) -> Option<PooledConnection<C>> {
        let conns = self.hosts.get_mut(host)?;
        let conn = conns.pop();
        if conns.is_empty() {
            self.hosts.remove(host);
        }
        conn
    }

    /// Remove every connection idle for longer than `max_idle`.
    ///
    /// Survivor order is not preserved.
    pub(crate) fn drain_idle(&mut self, max_idle: Duration) -> Vec<PooledConnection<C>> {
        self.drain_idle_at(Instant::now(), max_idle)
    }

    fn drain_idle_at(&mut self, now: Instant, max_idle: Duration) -> Vec<PooledConnection<C>> {
        let mut expired = Vec::new();
        for conns in self.hosts.values_mut() {
            let mut i = 0;
            while i < conns.len() {
                if conns[i].idle_time_at(now) > max_idle {
                    expired.push(conns.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.hosts.retain(|_, conns| !conns.is_empty());
        expired
    }

    /// Empty the pool, handing back every idle connection.
    pub(crate) fn drain_all(&mut self) -> Vec<PooledConnection<C>> {
        self.hosts.drain().flat_map(|(_, conns)| conns).collect()
    }

    pub(crate) fn len_for(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, Vec::len)
    }

    pub(crate) fn len(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub(crate) fn host_count(&self) -> usize {
        self.hosts.len()
    }
}
