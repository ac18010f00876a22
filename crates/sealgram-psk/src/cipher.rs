//! Record protection after the handshake.
//!
//! Datagrams can be lost or reordered, so the Noise transport's implicit
//! counter cannot be used. Each data record carries its sequence number,
//! which doubles as the AEAD nonce for snow's stateless transport.

use snow::{HandshakeState, StatelessTransportState};

use crate::handshake::HandshakeError;

/// AEAD tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Largest plaintext whose data record still fits one UDP datagram
/// (type byte and 8-byte sequence number included).
pub const MAX_PLAINTEXT: usize = 65_507 - 9 - TAG_LEN;

pub struct RecordCipher {
    transport: StatelessTransportState,
    handshake_hash: [u8; 32],
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher").finish_non_exhaustive()
    }
}

impl RecordCipher {
    pub(crate) fn from_handshake(state: HandshakeState) -> Result<Self, HandshakeError> {
        let mut handshake_hash = [0u8; 32];
        let hash = state.get_handshake_hash();
        let n = hash.len().min(32);
        handshake_hash[..n].copy_from_slice(&hash[..n]);

        let transport = state
            .into_stateless_transport_mode()
            .map_err(HandshakeError::Rejected)?;
        Ok(Self {
            transport,
            handshake_hash,
        })
    }

    /// Hash of the handshake transcript. Equal on both ends.
    pub fn handshake_hash(&self) -> &[u8; 32] {
        &self.handshake_hash
    }

    /// Encrypt `plaintext` under sequence number `seq`.
    pub fn seal(&self, seq: u64, plaintext: &[u8]) -> Result<Vec<u8>, snow::Error> {
        let mut out = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self.transport.write_message(seq, plaintext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decrypt a record sealed under `seq`.
    pub fn open(&self, seq: u64, ciphertext: &[u8]) -> Result<Vec<u8>, snow::Error> {
        let mut out = vec![0u8; ciphertext.len()];
        let len = self.transport.read_message(seq, ciphertext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }
}
