//! Store Transport Library
//!
//! Connection lifecycle base for a peer-to-peer store service: accepts
//! inbound connections and hands each to a caller-supplied handler, pools and
//! reuses outbound connections per remote host, reaps idle pooled
//! connections, and shuts everything down on request.
//!
//! The socket layer underneath is pluggable through [`layer::StreamLayer`];
//! [`layer::TcpLayer`] and [`layer::MemoryLayer`] are provided.

pub mod config;
pub mod connection;
pub mod error;
pub mod layer;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionPoolManager, PooledConnection};
pub use error::TransportError;
pub use layer::{Connection, ConnectionHandler, StreamLayer, TcpLayer};

/// Common error type for ambient fallible operations
pub type Result<T> = anyhow::Result<T>;
