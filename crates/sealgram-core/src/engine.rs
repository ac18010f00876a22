//! Record-layer engine interface.
//!
//! The socket layer never performs a handshake or touches key material
//! itself. It drives an [`Engine`] that owns the protocol state and reaches
//! back into the socket through three callbacks: transmit ciphertext,
//! deliver plaintext, and supply a credential for an identity.
//!
//! The engine only ever sees an [`AppHandle`]. Translating that handle back
//! into a socket context is the job of [`crate::registry`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Next handle to hand out. Zero is never used.
static NEXT_APP_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque integer identifying a socket context for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppHandle(u64);

impl AppHandle {
    /// Allocate a fresh, never-reused handle.
    pub fn next() -> Self {
        Self(NEXT_APP_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw integer value passed through the engine.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which credential the engine is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// The identity hint a server advertises. Not supported.
    Hint,
    /// The identity to present to the peer.
    Identity,
    /// The key for a (possibly absent) identity.
    Key,
}

/// Alert severity.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl TryFrom<u8> for AlertLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Warning),
            2 => Ok(Self::Fatal),
            other => Err(other),
        }
    }
}

/// Alert descriptions, numbered as in the DTLS alert registry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    DecompressionFailure = 30,
    HandshakeFailure = 40,
    BadCertificate = 42,
    IllegalParameter = 47,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UserCanceled = 90,
    NoRenegotiation = 100,
    UnsupportedExtension = 110,
}

impl AlertDescription {
    /// Lower-case name as used in log output.
    pub fn name(self) -> &'static str {
        match self {
            Self::CloseNotify => "close_notify",
            Self::UnexpectedMessage => "unexpected_message",
            Self::BadRecordMac => "bad_record_mac",
            Self::RecordOverflow => "record_overflow",
            Self::DecompressionFailure => "decompression_failure",
            Self::HandshakeFailure => "handshake_failure",
            Self::BadCertificate => "bad_certificate",
            Self::IllegalParameter => "illegal_parameter",
            Self::AccessDenied => "access_denied",
            Self::DecodeError => "decode_error",
            Self::DecryptError => "decrypt_error",
            Self::ProtocolVersion => "protocol_version",
            Self::InsufficientSecurity => "insufficient_security",
            Self::InternalError => "internal_error",
            Self::UserCanceled => "user_canceled",
            Self::NoRenegotiation => "no_renegotiation",
            Self::UnsupportedExtension => "unsupported_extension",
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for AlertDescription {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::CloseNotify,
            10 => Self::UnexpectedMessage,
            20 => Self::BadRecordMac,
            22 => Self::RecordOverflow,
            30 => Self::DecompressionFailure,
            40 => Self::HandshakeFailure,
            42 => Self::BadCertificate,
            47 => Self::IllegalParameter,
            49 => Self::AccessDenied,
            50 => Self::DecodeError,
            51 => Self::DecryptError,
            70 => Self::ProtocolVersion,
            71 => Self::InsufficientSecurity,
            80 => Self::InternalError,
            90 => Self::UserCanceled,
            100 => Self::NoRenegotiation,
            110 => Self::UnsupportedExtension,
            other => return Err(other),
        })
    }
}

/// Outcome of asking the engine to protect and transmit one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The payload was sent; the count is the plaintext length.
    Accepted(usize),
    /// A handshake is running. Retry later.
    InProgress,
    /// The engine could not transmit the record.
    IoFailure,
    /// The peer rejected the handshake with this alert.
    Refused(AlertDescription),
}

/// Errors reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("replayed record {0}")]
    Replay(u64),

    #[error("session not established")]
    NotEstablished,

    #[error("engine context destroyed")]
    Destroyed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("peer sent {level:?} alert: {description}")]
    Alert {
        level: AlertLevel,
        description: AlertDescription,
    },
}

/// Transmit ciphertext for a session. Returns the number of bytes sent.
pub type WriteFn<S> = fn(AppHandle, &S, &[u8]) -> io::Result<usize>;

/// Deliver decrypted application data for a session.
pub type ReadFn<S> = fn(AppHandle, &S, &[u8]);

/// Fill `out` with the requested credential, returning its length, or the
/// alert the engine should raise.
pub type KeyLookupFn<S> =
    fn(AppHandle, &S, CredentialKind, Option<&[u8]>, &mut [u8]) -> Result<usize, AlertDescription>;

/// Callbacks the socket layer installs into an engine context.
pub struct Callbacks<E: Engine> {
    pub write: WriteFn<E::Session>,
    pub read: ReadFn<E::Session>,
    pub key_lookup: KeyLookupFn<E::Session>,
}

impl<E: Engine> Clone for Callbacks<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Engine> Copy for Callbacks<E> {}

impl<E: Engine> fmt::Debug for Callbacks<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// A record-layer protocol engine.
///
/// One engine context exists per socket. All calls that take a session are
/// serialised by the peer-session table, so implementations only need
/// interior mutability for context-wide state such as installed callbacks.
pub trait Engine: Send + Sync + Sized + 'static {
    /// Per-peer protocol state. Owned exclusively by the session table.
    type Session: Send + 'static;

    /// Create a context that will echo `app` on every callback.
    fn create_context(app: AppHandle) -> Result<Self, EngineError>;

    /// Release context-wide resources. Called exactly once, after every
    /// session has been destroyed.
    fn destroy_context(&self);

    /// Install the socket layer's callbacks.
    fn set_callbacks(&self, callbacks: Callbacks<Self>);

    /// Feed one received datagram to the engine. Decrypted application data
    /// is delivered through the read callback.
    fn handle_incoming(&self, session: &mut Self::Session, data: &[u8])
        -> Result<(), EngineError>;

    /// Protect and transmit one payload, starting a handshake if needed.
    fn write_record(&self, session: &mut Self::Session, payload: &[u8]) -> WriteStatus;

    /// Allocate state for a new peer. `None` means out of memory.
    fn create_session(&self, addr: SocketAddr) -> Option<Self::Session>;

    /// Tear down a peer. An engine may emit a closing alert here.
    fn destroy_session(&self, session: Self::Session);

    /// Address of the peer a session belongs to.
    fn session_address(session: &Self::Session) -> SocketAddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = AppHandle::next();
        let b = AppHandle::next();
        assert_ne!(a, b);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn test_alert_roundtrip() {
        for desc in [
            AlertDescription::CloseNotify,
            AlertDescription::HandshakeFailure,
            AlertDescription::DecryptError,
            AlertDescription::InternalError,
        ] {
            assert_eq!(AlertDescription::try_from(desc as u8), Ok(desc));
        }
        assert_eq!(AlertDescription::try_from(255), Err(255));
        assert_eq!(AlertLevel::try_from(2), Ok(AlertLevel::Fatal));
        assert!(AlertLevel::try_from(3).is_err());
    }

    #[test]
    fn test_alert_names() {
        assert_eq!(AlertDescription::InternalError.name(), "internal_error");
        assert_eq!(AlertDescription::DecryptError.to_string(), "decrypt_error");
    }
}
