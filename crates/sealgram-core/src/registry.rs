//! Process-wide map from [`AppHandle`] to socket context.
//!
//! Engine callbacks only carry the handle. The receiver thread and the
//! callbacks resolve it here. An entry is registered when a socket is
//! constructed and removed by `close` once its threads have stopped, so a
//! callback racing a close either finds the full context or nothing.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use sealgram_common::{Error, Result};

use crate::engine::AppHandle;
use crate::queue::ConcurrentQueue;
use crate::security::SecurityStore;
use crate::socket::Datagram;
use crate::transport::Transport;

/// What a callback needs to reach its socket.
#[derive(Debug)]
pub struct SocketContext {
    pub transport: Arc<Transport>,
    pub queue: Arc<ConcurrentQueue<Datagram>>,
    pub security: Arc<RwLock<SecurityStore>>,
}

static CONTEXTS: Lazy<RwLock<HashMap<AppHandle, Arc<SocketContext>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register(handle: AppHandle, context: Arc<SocketContext>) {
    CONTEXTS.write().insert(handle, context);
}

/// Resolve a handle. A miss means a callback outlived its socket.
pub fn lookup(handle: AppHandle) -> Result<Arc<SocketContext>> {
    CONTEXTS
        .read()
        .get(&handle)
        .cloned()
        .ok_or(Error::UnknownHandle(handle.as_u64()))
}

pub fn unregister(handle: AppHandle) -> Option<Arc<SocketContext>> {
    CONTEXTS.write().remove(&handle)
}

pub fn contains(handle: AppHandle) -> bool {
    CONTEXTS.read().contains_key(&handle)
}
