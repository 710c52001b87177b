//! Inbound Connection Tracking

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifier of an accepted connection, unique per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live accepted connection as seen by the manager.
#[derive(Debug, Clone)]
pub struct InboundConnection {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub accepted_at: Instant,
    closer: CancellationToken,
}

impl InboundConnection {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            accepted_at: Instant::now(),
            closer,
        }
    }

    /// Force the connection closed. Its handling task deregisters it.
    pub(crate) fn close(&self) {
        self.closer.cancel();
    }
}

pub(crate) type InboundSet = Arc<RwLock<HashMap<ConnectionId, InboundConnection>>>;

/// Removes a connection from the inbound set when its handling task ends,
/// however it ends.
pub(crate) struct InboundGuard {
    id: ConnectionId,
    inbound: InboundSet,
}

impl InboundGuard {
    pub(crate) fn new(id: ConnectionId, inbound: InboundSet) -> Self {
        Self { id, inbound }
    }
}

impl Drop for InboundGuard {
    fn drop(&mut self) {
        let removed = self
            .inbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);

        if let Some(conn) = removed {
            debug!(
                "Connection {} from {} closed after {:?}",
                self.id,
                conn.remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                conn.accepted_at.elapsed()
            );
        }
    }
}
