//! Plaintext engine used by unit tests.
//!
//! Records are the payload itself. The first write to a peer reports a
//! handshake in progress so the send retry path is exercised.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::engine::{
    AlertDescription, AppHandle, Callbacks, Engine, EngineError, WriteStatus,
};

pub(crate) struct MockSession {
    addr: SocketAddr,
    ready: bool,
}

pub(crate) struct MockEngine {
    app: AppHandle,
    callbacks: RwLock<Option<Callbacks<Self>>>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub contexts_destroyed: AtomicUsize,
    pub fail_alloc: AtomicBool,
    pub refuse: AtomicBool,
    pub stall: AtomicBool,
}

impl Engine for MockEngine {
    type Session = MockSession;

    fn create_context(app: AppHandle) -> Result<Self, EngineError> {
        Ok(Self {
            app,
            callbacks: RwLock::new(None),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            contexts_destroyed: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            stall: AtomicBool::new(false),
        })
    }

    fn destroy_context(&self) {
        self.contexts_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_callbacks(&self, callbacks: Callbacks<Self>) {
        *self.callbacks.write() = Some(callbacks);
    }

    fn handle_incoming(&self, session: &mut MockSession, data: &[u8]) -> Result<(), EngineError> {
        let callbacks = (*self.callbacks.read()).ok_or(EngineError::NotEstablished)?;
        (callbacks.read)(self.app, session, data);
        Ok(())
    }

    fn write_record(&self, session: &mut MockSession, payload: &[u8]) -> WriteStatus {
        if self.refuse.load(Ordering::SeqCst) {
            return WriteStatus::Refused(AlertDescription::HandshakeFailure);
        }
        if self.stall.load(Ordering::SeqCst) || !session.ready {
            session.ready = true;
            return WriteStatus::InProgress;
        }
        let Some(callbacks) = *self.callbacks.read() else {
            return WriteStatus::IoFailure;
        };
        match (callbacks.write)(self.app, session, payload) {
            Ok(_) => WriteStatus::Accepted(payload.len()),
            Err(_) => WriteStatus::IoFailure,
        }
    }

    fn create_session(&self, addr: SocketAddr) -> Option<MockSession> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return None;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Some(MockSession { addr, ready: false })
    }

    fn destroy_session(&self, _session: MockSession) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn session_address(session: &MockSession) -> SocketAddr {
        session.addr
    }
}
