//! Common error types for Sealgram.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias using Sealgram's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for socket, store and session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `send` without an explicit destination on an unconnected socket.
    #[error("destination address required")]
    DestinationRequired,

    /// Non-blocking operation found nothing to return.
    #[error("operation would block")]
    WouldBlock,

    /// Definite transport failure (bind, send, record write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine could not allocate a session for a peer.
    #[error("out of memory: cannot allocate session for {0}")]
    OutOfMemory(SocketAddr),

    /// A key was empty.
    #[error("key must be non-empty")]
    InvalidKey,

    /// A default was requested from a store with no identities.
    #[error("cannot retrieve a default from an empty security store")]
    EmptyStore,

    /// Default identity must already exist in the store.
    #[error("unknown identity")]
    UnknownIdentity,

    /// Default key must already exist in the store.
    #[error("unknown key")]
    UnknownKey,

    /// The peer rejected the handshake.
    #[error("connection refused by {peer}: {reason}")]
    ConnectionRefused { peer: SocketAddr, reason: String },

    /// The handshake did not complete within the configured bound.
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    /// The socket (or one of its components) has been closed.
    #[error("socket closed")]
    Closed,

    /// Host name could not be resolved to a usable address.
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// The address family does not match the socket's.
    #[error("unsupported address family: {0}")]
    UnsupportedFamily(String),

    /// No socket context is registered under this handle.
    #[error("no socket context registered for handle {0}")]
    UnknownHandle(u64),

    /// The record-layer engine reported a failure.
    #[error("engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Create an address resolution error from any displayable type.
    pub fn resolution(msg: impl std::fmt::Display) -> Self {
        Self::AddressResolution(msg.to_string())
    }

    /// Create an unsupported family error from any displayable type.
    pub fn unsupported_family(msg: impl std::fmt::Display) -> Self {
        Self::UnsupportedFamily(msg.to_string())
    }

    /// Create an engine error from any displayable type.
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }
}
