//! Session lifecycle and concurrency layer for Sealgram.
//!
//! This crate turns a callback-driven record-layer [`Engine`] into a
//! thread-safe datagram socket:
//! - [`ConcurrentQueue`] buffers decrypted datagrams for the application
//! - [`registry`] maps the opaque handle an engine echoes back to its socket
//! - [`PeerSessionTable`] owns one engine session per peer and evicts idle ones
//! - [`SecurityStore`] answers the engine's pre-shared-key lookups
//! - [`SecureDatagramSocket`] ties them together
//!
//! The engine itself is supplied by another crate (see `sealgram-psk`).

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod security;
pub mod session_table;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{AddressFamily, SocketConfig};
pub use engine::{
    AlertDescription, AlertLevel, AppHandle, Callbacks, CredentialKind, Engine, EngineError,
    WriteStatus,
};
pub use queue::ConcurrentQueue;
pub use security::SecurityStore;
pub use session_table::PeerSessionTable;
pub use socket::{Datagram, SecureDatagramSocket, SocketState};

pub use sealgram_common::{Error, Result};
