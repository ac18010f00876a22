//! Pre-shared-key handshake.
//!
//! Uses `Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s`: two messages, ephemeral
//! keys on both sides, and the pre-shared key mixed in before the first
//! message. A peer holding a different key fails to read the first (or
//! second) message, so a wrong key is detected during the handshake rather
//! than on the first data record.
//!
//! ```text
//! Initiator                               Responder
//!     |  -> psk, e        (ClientHello)       |
//!     |-------------------------------------->|
//!     |  <- e, ee         (ServerHello)       |
//!     |<--------------------------------------|
//!     [        transport keys established      ]
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::RecordCipher;

/// Noise protocol pattern.
const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s";

/// Domain label mixed into the pre-shared key.
const PSK_LABEL: &[u8] = b"sealgram psk v1";

/// Upper bound for a handshake message.
pub const MAX_HANDSHAKE_MSG_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake already complete")]
    AlreadyComplete,

    #[error("handshake message rejected: {0}")]
    Rejected(snow::Error),

    #[error("failed to build noise state: {0}")]
    Setup(String),
}

/// Stretch an arbitrary-length stored key to the 32 bytes Noise expects.
fn derive_psk(key: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(PSK_LABEL);
    hasher.update((key.len() as u64).to_be_bytes());
    hasher.update(key);
    Zeroizing::new(hasher.finalize().into())
}

fn build(key: &[u8], initiator: bool) -> Result<HandshakeState> {
    let psk = derive_psk(key);
    let builder = Builder::new(NOISE_PATTERN.parse()?).psk(0, &psk[..]);
    let state = if initiator {
        builder
            .build_initiator()
            .context("failed to build noise initiator")?
    } else {
        builder
            .build_responder()
            .context("failed to build noise responder")?
    };
    Ok(state)
}

/// Client side of the handshake.
pub struct PskInitiator {
    state: Option<Box<HandshakeState>>,
}

impl std::fmt::Debug for PskInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskInitiator")
            .field("pending", &self.state.is_some())
            .finish()
    }
}

impl PskInitiator {
    /// Create an initiator and produce the first handshake message.
    pub fn start(key: &[u8]) -> Result<(Self, Vec<u8>), HandshakeError> {
        let mut state = build(key, true).map_err(|e| HandshakeError::Setup(format!("{e:#}")))?;
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state
            .write_message(&[], &mut buf)
            .map_err(HandshakeError::Rejected)?;
        buf.truncate(len);
        Ok((
            Self {
                state: Some(Box::new(state)),
            },
            buf,
        ))
    }

    /// Consume the responder's reply and switch to transport mode.
    ///
    /// The initiator is spent either way; a rejected reply means the
    /// handshake has to start over.
    pub fn finish(&mut self, message: &[u8]) -> Result<RecordCipher, HandshakeError> {
        let mut state = self.state.take().ok_or(HandshakeError::AlreadyComplete)?;
        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        state
            .read_message(message, &mut payload)
            .map_err(HandshakeError::Rejected)?;
        RecordCipher::from_handshake(*state)
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_some()
    }
}

/// Server side of the handshake. Stateless: one message in, one out.
pub struct PskResponder;

impl PskResponder {
    /// Answer a first handshake message.
    pub fn respond(key: &[u8], message: &[u8]) -> Result<(RecordCipher, Vec<u8>), HandshakeError> {
        let mut state = build(key, false).map_err(|e| HandshakeError::Setup(format!("{e:#}")))?;

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        state
            .read_message(message, &mut payload)
            .map_err(HandshakeError::Rejected)?;

        let mut reply = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state
            .write_message(&[], &mut reply)
            .map_err(HandshakeError::Rejected)?;
        reply.truncate(len);

        Ok((RecordCipher::from_handshake(state)?, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_keys() {
        let (mut initiator, msg1) = PskInitiator::start(b"secretPSK").unwrap();
        let (responder_cipher, msg2) = PskResponder::respond(b"secretPSK", &msg1).unwrap();
        let initiator_cipher = initiator.finish(&msg2).unwrap();

        assert_eq!(
            initiator_cipher.handshake_hash(),
            responder_cipher.handshake_hash()
        );

        let ct = initiator_cipher.seal(0, b"hello").unwrap();
        assert_eq!(responder_cipher.open(0, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_mismatched_keys() {
        let (_, msg1) = PskInitiator::start(b"secretPSK").unwrap();
        assert!(matches!(
            PskResponder::respond(b"otherPSK", &msg1),
            Err(HandshakeError::Rejected(_))
        ));
    }

    #[test]
    fn test_garbage_reply_spends_initiator() {
        let (mut initiator, _) = PskInitiator::start(b"k").unwrap();
        assert!(initiator.is_pending());
        assert!(matches!(
            initiator.finish(&[0u8; 48]),
            Err(HandshakeError::Rejected(_))
        ));
        assert!(!initiator.is_pending());
        assert!(matches!(
            initiator.finish(&[0u8; 48]),
            Err(HandshakeError::AlreadyComplete)
        ));
    }

    #[test]
    fn test_derived_psk_depends_on_key() {
        assert_ne!(*derive_psk(b"a"), *derive_psk(b"b"));
        assert_eq!(*derive_psk(b"a"), *derive_psk(b"a"));
    }
}
