//! Error types for the sockets crate.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by listeners, connections and their streams.
///
/// The type is `Clone` so that a single loop fault can be delivered to every
/// subscriber of a stream; I/O causes are shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum SocketError {
    /// The listening address is in use or unavailable.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: Arc<io::Error>,
    },

    /// An argument was rejected before any socket was created.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An outbound connection was refused or the peer is unreachable.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address that was dialled.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The connect timeout elapsed before the connection was established.
    #[error("connection to {0} timed out")]
    Timeout(SocketAddr),

    /// The connect attempt was cancelled.
    #[error("connection to {0} was cancelled")]
    Cancelled(SocketAddr),

    /// The endpoint was disposed, or its connection was lost.
    #[error("socket is not connected")]
    NotConnected,

    /// A transport fault not caused by disposal.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl SocketError {
    pub(crate) fn bind(addr: SocketAddr, err: io::Error) -> Self {
        Self::Bind {
            addr,
            source: Arc::new(err),
        }
    }

    pub(crate) fn connect(addr: SocketAddr, err: io::Error) -> Self {
        Self::Connect {
            addr,
            source: Arc::new(err),
        }
    }

    /// Returns `true` for [`SocketError::NotConnected`].
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// The kind of the underlying I/O error, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Bind { source, .. } | Self::Connect { source, .. } | Self::Io(source) => {
                Some(source.kind())
            }
            _ => None,
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A specialized Result type for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;
