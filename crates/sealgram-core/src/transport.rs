//! Plain UDP transport underneath the record layer.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use parking_lot::RwLock;
use sealgram_common::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tracing::debug;

use crate::config::AddressFamily;

/// Upper bound for sends where the platform has no per-call don't-wait flag.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// UDP socket that can be closed while other threads hold a reference.
#[derive(Debug)]
pub struct Transport {
    socket: RwLock<Option<UdpSocket>>,
    family: AddressFamily,
}

impl Transport {
    /// Create an unbound socket. `poll` becomes the read timeout.
    pub fn new(family: AddressFamily, poll: Duration) -> Result<Self> {
        let domain = match family {
            AddressFamily::V4 => Domain::IPV4,
            AddressFamily::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(poll))?;
        socket.set_write_timeout(Some(WRITE_TIMEOUT))?;

        Ok(Self {
            socket: RwLock::new(Some(socket.into())),
            family,
        })
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        if !self.family.matches(&addr) {
            return Err(Error::unsupported_family(addr));
        }
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(Error::Closed)?;
        SockRef::from(socket).bind(&SockAddr::from(addr))?;
        debug!(addr = %addr, "transport bound");
        Ok(())
    }

    /// Send one datagram without waiting for buffer space. A full send
    /// buffer fails with `WouldBlock` and the record is lost, as on the wire.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        send_dont_wait(socket, buf, addr)
    }

    /// Receive one datagram. Times out after the poll interval with
    /// `WouldBlock` or `TimedOut`.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        socket.recv_from(buf)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(Error::Closed)?;
        Ok(socket.local_addr()?)
    }

    /// Drop the OS socket. Later calls fail.
    pub fn close(&self) {
        if self.socket.write().take().is_some() {
            debug!("transport closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.read().is_none()
    }
}

#[cfg(unix)]
fn send_dont_wait(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    SockRef::from(socket).send_to_with_flags(buf, &SockAddr::from(addr), libc::MSG_DONTWAIT)
}

#[cfg(not(unix))]
fn send_dont_wait(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    socket.send_to(buf, addr)
}

/// Whether a receive error only means the poll interval elapsed.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
