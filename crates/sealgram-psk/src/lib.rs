//! Pre-shared-key record-layer engine for Sealgram.
//!
//! This crate provides:
//! - A two-message Noise handshake keyed by a pre-shared key
//! - Explicit-nonce record protection that tolerates loss and reordering
//! - A replay window for data records
//! - [`PskEngine`], which plugs all of the above into
//!   [`sealgram_core::SecureDatagramSocket`]
//!
//! # Design
//!
//! Uses `Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s`. Both ends generate fresh
//! ephemeral keys per session, so every session gets forward secrecy, and
//! only holders of the same pre-shared key can complete the handshake.
//!
//! After the handshake, records are sealed with snow's stateless transport
//! using the record sequence number as nonce.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod engine;
pub mod handshake;
pub mod record;
pub mod seq_window;

pub use cipher::RecordCipher;
pub use engine::{PskEngine, PskSession};
pub use handshake::{HandshakeError, PskInitiator, PskResponder};
pub use record::{Record, RecordError, RecordType};
pub use seq_window::ReplayWindow;

/// Secure datagram socket using the pre-shared-key engine.
pub type PskSocket = sealgram_core::SecureDatagramSocket<PskEngine>;
