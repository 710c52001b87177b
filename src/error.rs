//! Transport Errors

use std::io;
use thiserror::Error;

/// Errors surfaced synchronously to callers checking out outbound connections.
///
/// Accept and close failures never reach callers; they are logged where they
/// happen.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The manager has begun shutting down and accepts no new work.
    #[error("transport is shut down")]
    Shutdown,

    /// The stream layer failed to dial the requested host.
    #[error("failed to dial {host}")]
    Dial {
        host: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Whether this error was caused by shutdown rather than I/O.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TransportError::Shutdown)
    }

    /// Recover the underlying I/O error.
    ///
    /// A dial failure yields the layer's error unchanged; shutdown maps to
    /// `NotConnected`.
    pub fn into_io(self) -> io::Error {
        match self {
            TransportError::Shutdown => io::Error::new(io::ErrorKind::NotConnected, self),
            TransportError::Dial { source, .. } => source,
        }
    }
}
