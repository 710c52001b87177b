//! Connection Management Module
//!
//! Tracks accepted connections, pools outbound ones per host, reaps idle
//! pooled connections, and coordinates shutdown.

pub mod inbound;
pub mod manager;
pub mod pool;

pub use inbound::{ConnectionId, InboundConnection};
pub use manager::{ConnectionPoolManager, ConnectionStats, DEFAULT_REAP_INTERVAL};
pub use pool::PooledConnection;
