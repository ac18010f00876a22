//! [`Engine`] implementation over the PSK handshake and record cipher.
//!
//! Per-peer state machine:
//!
//! ```text
//! Idle --write--> Connecting --ServerHello--> Established
//!   ^                 |                           |
//!   |            fatal Alert                   any Alert
//!   |                 v                           |
//!   +---write---- Refused <-----------------------+ (to Idle)
//! ```
//!
//! A peer that receives a ClientHello answers it and becomes Established as
//! responder. If both ends start a handshake at the same time, the end whose
//! hello sorts lower yields and answers the other's.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use sealgram_core::{
    AlertDescription, AlertLevel, AppHandle, Callbacks, CredentialKind, Engine, EngineError,
    WriteStatus,
};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::cipher::{RecordCipher, MAX_PLAINTEXT};
use crate::handshake::{PskInitiator, PskResponder};
use crate::record::Record;
use crate::seq_window::ReplayWindow;

/// Resend a pending ClientHello after this long without a reply.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Buffer offered to the key-lookup callback.
const CREDENTIAL_BUF_LEN: usize = 256;

/// Pre-shared-key record-layer engine.
pub struct PskEngine {
    app: AppHandle,
    callbacks: RwLock<Option<Callbacks<Self>>>,
    destroyed: AtomicBool,
}

/// State kept for one peer.
pub struct PskSession {
    addr: SocketAddr,
    state: PeerState,
}

impl PskSession {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, PeerState::Established(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, PeerState::Connecting { .. })
    }
}

enum PeerState {
    Idle,
    Connecting {
        initiator: PskInitiator,
        hello: Bytes,
        last_sent: Instant,
    },
    Established(Box<Established>),
    /// The peer refused our handshake. Reported once by the next write.
    Refused(AlertDescription),
}

struct Established {
    cipher: RecordCipher,
    next_seq: u64,
    window: ReplayWindow,
    /// Responder only: the hello we answered and our reply, for
    /// retransmitted hellos.
    hello: Option<Bytes>,
    reply: Option<Bytes>,
}

impl Established {
    fn new(cipher: RecordCipher) -> Self {
        Self {
            cipher,
            next_seq: 0,
            window: ReplayWindow::new(),
            hello: None,
            reply: None,
        }
    }
}

type Step = (PeerState, Result<(), EngineError>);

impl PskEngine {
    fn callbacks(&self) -> Result<Callbacks<Self>, EngineError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(EngineError::Destroyed);
        }
        (*self.callbacks.read())
            .ok_or_else(|| EngineError::Handshake("callbacks not installed".into()))
    }

    fn send_bytes(&self, cb: &Callbacks<Self>, session: &PskSession, wire: &[u8]) -> Result<(), EngineError> {
        (cb.write)(self.app, session, wire)?;
        Ok(())
    }

    fn send_record(&self, cb: &Callbacks<Self>, session: &PskSession, record: &Record) -> Result<(), EngineError> {
        let wire = record
            .encode()
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        self.send_bytes(cb, session, &wire)
    }

    fn send_alert(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        level: AlertLevel,
        description: AlertDescription,
    ) -> Result<(), EngineError> {
        debug!(peer = %session.addr, alert = %description, ?level, "sending alert");
        self.send_record(cb, session, &Record::Alert { level, description })
    }

    fn credential(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        kind: CredentialKind,
        hint: Option<&[u8]>,
    ) -> Result<Zeroizing<Vec<u8>>, AlertDescription> {
        let mut buf = Zeroizing::new(vec![0u8; CREDENTIAL_BUF_LEN]);
        let len = (cb.key_lookup)(self.app, session, kind, hint, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn start_handshake(&self, cb: &Callbacks<Self>, session: &PskSession) -> (PeerState, WriteStatus) {
        let identity = match self.credential(cb, session, CredentialKind::Identity, None) {
            Ok(identity) => identity,
            Err(alert) => {
                warn!(peer = %session.addr, alert = %alert, "no identity configured");
                return (PeerState::Idle, WriteStatus::Refused(alert));
            }
        };
        let key = match self.credential(cb, session, CredentialKind::Key, None) {
            Ok(key) => key,
            Err(alert) => {
                warn!(peer = %session.addr, alert = %alert, "no key configured");
                return (PeerState::Idle, WriteStatus::Refused(alert));
            }
        };

        let (initiator, noise) = match PskInitiator::start(&key) {
            Ok(started) => started,
            Err(e) => {
                warn!(peer = %session.addr, error = %e, "failed to start handshake");
                return (PeerState::Idle, WriteStatus::IoFailure);
            }
        };
        let hello = Record::ClientHello {
            identity: Bytes::copy_from_slice(&identity),
            noise: noise.into(),
        };
        let hello = match hello.encode() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(peer = %session.addr, error = %e, "cannot encode client hello");
                return (PeerState::Idle, WriteStatus::Refused(AlertDescription::InternalError));
            }
        };

        match self.send_bytes(cb, session, &hello) {
            Ok(()) => {
                debug!(peer = %session.addr, "handshake started");
                let state = PeerState::Connecting {
                    initiator,
                    hello,
                    last_sent: Instant::now(),
                };
                (state, WriteStatus::InProgress)
            }
            Err(e) => {
                debug!(peer = %session.addr, error = %e, "failed to send client hello");
                (PeerState::Idle, WriteStatus::IoFailure)
            }
        }
    }

    fn seal_and_send(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        est: &mut Established,
        payload: &[u8],
    ) -> WriteStatus {
        if payload.len() > MAX_PLAINTEXT {
            warn!(peer = %session.addr, len = payload.len(), "payload too large for one record");
            return WriteStatus::IoFailure;
        }

        let seq = est.next_seq;
        let ciphertext = match est.cipher.seal(seq, payload) {
            Ok(ct) => ct,
            Err(e) => {
                warn!(peer = %session.addr, error = %e, "encryption failed");
                return WriteStatus::IoFailure;
            }
        };
        est.next_seq += 1;

        let record = Record::Data {
            seq,
            ciphertext: ciphertext.into(),
        };
        match self.send_record(cb, session, &record) {
            Ok(()) => WriteStatus::Accepted(payload.len()),
            Err(e) => {
                debug!(peer = %session.addr, error = %e, "failed to send record");
                WriteStatus::IoFailure
            }
        }
    }

    fn on_client_hello(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        state: PeerState,
        raw: &[u8],
        identity: &[u8],
        noise: &[u8],
    ) -> Step {
        if let PeerState::Established(est) = &state {
            if est.hello.as_deref() == Some(raw) {
                trace!(peer = %session.addr, "retransmitted hello, resending reply");
                let result = match &est.reply {
                    Some(reply) => self.send_bytes(cb, session, reply),
                    None => Ok(()),
                };
                return (state, result);
            }
        }
        if let PeerState::Connecting { hello, .. } = &state {
            if &hello[..] > raw {
                trace!(peer = %session.addr, "crossed hellos, keeping ours");
                return (state, Ok(()));
            }
        }

        let hint = (!identity.is_empty()).then_some(identity);
        let key = match self.credential(cb, session, CredentialKind::Key, hint) {
            Ok(key) => key,
            Err(alert) => {
                let err = EngineError::Handshake(format!("no key for identity ({alert})"));
                return self.reject_hello(cb, session, state, alert, err);
            }
        };

        let (cipher, noise_reply) = match PskResponder::respond(&key, noise) {
            Ok(answered) => answered,
            Err(e) => {
                let err = EngineError::Handshake(e.to_string());
                return self.reject_hello(cb, session, state, AlertDescription::DecryptError, err);
            }
        };

        let reply = match (Record::ServerHello { noise: noise_reply.into() }).encode() {
            Ok(wire) => wire,
            Err(e) => return (PeerState::Idle, Err(EngineError::Malformed(e.to_string()))),
        };
        let result = self.send_bytes(cb, session, &reply);
        debug!(peer = %session.addr, "handshake complete (responder)");

        let mut est = Established::new(cipher);
        est.hello = Some(Bytes::copy_from_slice(raw));
        est.reply = Some(reply);
        (PeerState::Established(Box::new(est)), result)
    }

    /// A hello that fails authentication is unauthenticated input, so it
    /// must not disturb an established session. Other peers are refused.
    fn reject_hello(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        state: PeerState,
        alert: AlertDescription,
        err: EngineError,
    ) -> Step {
        if let PeerState::Established(_) = state {
            debug!(peer = %session.addr, error = %err, "ignoring bad hello on established session");
            return (state, Err(err));
        }
        warn!(peer = %session.addr, alert = %alert, error = %err, "rejecting handshake");
        let _ = self.send_alert(cb, session, AlertLevel::Fatal, alert);
        (PeerState::Idle, Err(err))
    }

    fn on_server_hello(&self, session: &PskSession, state: PeerState, noise: &[u8]) -> Step {
        match state {
            PeerState::Connecting { mut initiator, .. } => match initiator.finish(noise) {
                Ok(cipher) => {
                    debug!(peer = %session.addr, "handshake complete (initiator)");
                    (PeerState::Established(Box::new(Established::new(cipher))), Ok(()))
                }
                Err(e) => {
                    // Start over on the next write.
                    warn!(peer = %session.addr, error = %e, "invalid server hello");
                    (PeerState::Idle, Err(EngineError::Handshake(e.to_string())))
                }
            },
            other => {
                trace!(peer = %session.addr, "ignoring unsolicited server hello");
                (other, Ok(()))
            }
        }
    }

    fn on_alert(
        &self,
        session: &PskSession,
        state: PeerState,
        level: AlertLevel,
        description: AlertDescription,
    ) -> Step {
        let alert = EngineError::Alert { level, description };
        match state {
            PeerState::Connecting { .. } if level == AlertLevel::Fatal => {
                warn!(peer = %session.addr, alert = %description, "handshake refused by peer");
                (PeerState::Refused(description), Err(alert))
            }
            PeerState::Established(_) => {
                debug!(peer = %session.addr, alert = %description, "peer ended session");
                let result = if description == AlertDescription::CloseNotify {
                    Ok(())
                } else {
                    Err(alert)
                };
                (PeerState::Idle, result)
            }
            other => {
                trace!(peer = %session.addr, alert = %description, "ignoring alert");
                (other, Ok(()))
            }
        }
    }

    fn on_data(
        &self,
        cb: &Callbacks<Self>,
        session: &PskSession,
        state: PeerState,
        seq: u64,
        ciphertext: &[u8],
    ) -> Step {
        let mut est = match state {
            PeerState::Established(est) => est,
            other => {
                debug!(peer = %session.addr, "data before handshake");
                let _ = self.send_alert(
                    cb,
                    session,
                    AlertLevel::Fatal,
                    AlertDescription::UnexpectedMessage,
                );
                return (other, Err(EngineError::NotEstablished));
            }
        };

        if !est.window.check(seq) {
            return (PeerState::Established(est), Err(EngineError::Replay(seq)));
        }
        let result = match est.cipher.open(seq, ciphertext) {
            Ok(plaintext) => {
                est.window.mark(seq);
                (cb.read)(self.app, session, &plaintext);
                Ok(())
            }
            Err(_) => Err(EngineError::Decrypt),
        };
        (PeerState::Established(est), result)
    }
}

impl Engine for PskEngine {
    type Session = PskSession;

    fn create_context(app: AppHandle) -> Result<Self, EngineError> {
        Ok(Self {
            app,
            callbacks: RwLock::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    fn destroy_context(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.callbacks.write().take();
        debug!(handle = %self.app, "engine context destroyed");
    }

    fn set_callbacks(&self, callbacks: Callbacks<Self>) {
        *self.callbacks.write() = Some(callbacks);
    }

    fn handle_incoming(&self, session: &mut PskSession, data: &[u8]) -> Result<(), EngineError> {
        let cb = self.callbacks()?;
        let record = Record::decode(data).map_err(|e| EngineError::Malformed(e.to_string()))?;

        let state = mem::replace(&mut session.state, PeerState::Idle);
        let (next, result) = match record {
            Record::ClientHello { identity, noise } => {
                self.on_client_hello(&cb, session, state, data, &identity, &noise)
            }
            Record::ServerHello { noise } => self.on_server_hello(session, state, &noise),
            Record::Alert { level, description } => {
                self.on_alert(session, state, level, description)
            }
            Record::Data { seq, ciphertext } => {
                self.on_data(&cb, session, state, seq, &ciphertext)
            }
        };
        session.state = next;
        result
    }

    fn write_record(&self, session: &mut PskSession, payload: &[u8]) -> WriteStatus {
        let cb = match self.callbacks() {
            Ok(cb) => cb,
            Err(e) => {
                debug!(peer = %session.addr, error = %e, "write on unusable engine");
                return WriteStatus::IoFailure;
            }
        };

        let state = mem::replace(&mut session.state, PeerState::Idle);
        let (next, status) = match state {
            PeerState::Idle => self.start_handshake(&cb, session),
            PeerState::Connecting {
                initiator,
                hello,
                last_sent,
            } => {
                if last_sent.elapsed() < RETRANSMIT_INTERVAL {
                    let state = PeerState::Connecting {
                        initiator,
                        hello,
                        last_sent,
                    };
                    (state, WriteStatus::InProgress)
                } else {
                    trace!(peer = %session.addr, "retransmitting client hello");
                    let status = match self.send_bytes(&cb, session, &hello) {
                        Ok(()) => WriteStatus::InProgress,
                        Err(_) => WriteStatus::IoFailure,
                    };
                    let state = PeerState::Connecting {
                        initiator,
                        hello,
                        last_sent: Instant::now(),
                    };
                    (state, status)
                }
            }
            PeerState::Established(mut est) => {
                let status = self.seal_and_send(&cb, session, &mut est, payload);
                (PeerState::Established(est), status)
            }
            PeerState::Refused(alert) => (PeerState::Idle, WriteStatus::Refused(alert)),
        };
        session.state = next;
        status
    }

    fn create_session(&self, addr: SocketAddr) -> Option<PskSession> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        Some(PskSession {
            addr,
            state: PeerState::Idle,
        })
    }

    fn destroy_session(&self, session: PskSession) {
        if !session.is_established() {
            return;
        }
        if let Ok(cb) = self.callbacks() {
            if let Err(e) = self.send_alert(&cb, &session, AlertLevel::Warning, AlertDescription::CloseNotify) {
                debug!(peer = %session.addr, error = %e, "close_notify not sent");
            }
        }
    }

    fn session_address(session: &PskSession) -> SocketAddr {
        session.addr()
    }
}
