//! Per-peer engine sessions with second-chance eviction.
//!
//! Every send or receive touching a peer marks its entry as used. A sweep
//! thread wakes once per timeout: used entries get their flag cleared, idle
//! ones are destroyed. A peer therefore survives as long as it is active at
//! least once per interval and is reclaimed after two silent ones.
//!
//! All engine access for a socket happens under the table mutex, which also
//! orders creation, use and eviction of sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sealgram_common::{Error, Result};
use tracing::{debug, trace, warn};

use crate::engine::Engine;

struct PeerEntry<S> {
    session: S,
    used: bool,
}

struct TableState<S> {
    sessions: HashMap<SocketAddr, PeerEntry<S>>,
    closed: bool,
}

struct Shared<E: Engine> {
    engine: Arc<E>,
    state: Mutex<TableState<E::Session>>,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl<E: Engine> Shared<E> {
    fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let idle: Vec<SocketAddr> = state
            .sessions
            .iter_mut()
            .filter_map(|(addr, entry)| {
                if entry.used {
                    entry.used = false;
                    None
                } else {
                    Some(*addr)
                }
            })
            .collect();

        for addr in &idle {
            if let Some(entry) = state.sessions.remove(addr) {
                debug!(peer = %addr, "evicting idle session");
                self.engine.destroy_session(entry.session);
            }
        }
        idle.len()
    }

    fn run_sweeper(&self, timeout: Duration) {
        loop {
            let mut stopped = self.stop.lock();
            let deadline = Instant::now() + timeout;
            while !*stopped {
                if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
            drop(stopped);

            let evicted = self.sweep();
            if evicted > 0 {
                trace!(evicted, "sweep pass finished");
            }
        }
    }
}

/// Map from peer address to engine session, owning the sweep thread.
pub struct PeerSessionTable<E: Engine> {
    shared: Arc<Shared<E>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl<E: Engine> PeerSessionTable<E> {
    /// Create an empty table and start its sweep thread.
    pub fn new(engine: Arc<E>, timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            engine,
            state: Mutex::new(TableState {
                sessions: HashMap::new(),
                closed: false,
            }),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("sealgram-sweep".into())
            .spawn(move || worker.run_sweeper(timeout))?;

        Ok(Self {
            shared,
            sweeper: Mutex::new(Some(handle)),
            timeout,
        })
    }

    /// Run `f` on the session for `addr`, creating it first if needed.
    ///
    /// The table stays locked for the duration of `f`.
    pub fn with_session<R>(
        &self,
        addr: SocketAddr,
        f: impl FnOnce(&E, &mut E::Session) -> R,
    ) -> Result<R> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let engine = &self.shared.engine;
        let entry = match state.sessions.entry(addr) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let session = engine
                    .create_session(addr)
                    .ok_or(Error::OutOfMemory(addr))?;
                debug!(peer = %addr, "created session");
                v.insert(PeerEntry {
                    session,
                    used: false,
                })
            }
        };
        entry.used = true;
        Ok(f(engine, &mut entry.session))
    }

    /// One clock-hand pass. Returns the number of sessions destroyed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the sweep thread and destroy every session.
    ///
    /// Later calls do nothing; later `with_session` calls fail with `Closed`.
    pub fn evict_all(&self) {
        {
            let mut stopped = self.shared.stop.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.sweeper.lock().take() {
            if handle.join().is_err() {
                warn!("sweep thread panicked");
            }
        }

        let mut state = self.shared.state.lock();
        state.closed = true;
        let drained: Vec<_> = state.sessions.drain().collect();
        for (addr, entry) in drained {
            debug!(peer = %addr, "destroying session");
            self.shared.engine.destroy_session(entry.session);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.shared.state.lock().sessions.contains_key(addr)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }
}

impl<E: Engine> Drop for PeerSessionTable<E> {
    fn drop(&mut self) {
        self.evict_all();
    }
}
