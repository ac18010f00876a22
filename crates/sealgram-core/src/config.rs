//! Socket configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// IP family a socket is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    /// Whether `addr` belongs to this family.
    pub fn matches(self, addr: &SocketAddr) -> bool {
        matches!(
            (self, addr),
            (Self::V4, SocketAddr::V4(_)) | (Self::V6, SocketAddr::V6(_))
        )
    }

    /// Wildcard address on `port`.
    pub fn unspecified(self, port: u16) -> SocketAddr {
        match self {
            Self::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            Self::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        }
    }

    /// Family of an existing address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

/// Construction-time settings for a secure datagram socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Address family of the underlying UDP socket.
    pub family: AddressFamily,
    /// Idle interval after which an unused peer session is marked, in ms.
    /// A session silent for two intervals is destroyed.
    pub eviction_timeout_ms: u64,
    /// Sleep between send attempts while a handshake is running, in ms.
    pub send_backoff_ms: u64,
    /// Upper bound on how long a send waits for a handshake, in ms.
    /// `None` retries forever.
    pub handshake_timeout_ms: Option<u64>,
    /// Read timeout of the receiver thread, in ms. Bounds how long close
    /// waits for the receiver to notice.
    pub receive_poll_ms: u64,
    /// Receive buffer size for one datagram.
    pub max_datagram_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            family: AddressFamily::V4,
            eviction_timeout_ms: 5 * 60 * 1000,
            send_backoff_ms: 100,
            handshake_timeout_ms: Some(30_000),
            receive_poll_ms: 100,
            max_datagram_size: 65_507,
        }
    }
}

impl SocketConfig {
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_eviction_timeout(mut self, timeout: Duration) -> Self {
        self.eviction_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_send_backoff(mut self, backoff: Duration) -> Self {
        self.send_backoff_ms = duration_ms(backoff);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_receive_poll(mut self, poll: Duration) -> Self {
        self.receive_poll_ms = duration_ms(poll);
        self
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms.max(1))
    }

    pub fn send_backoff(&self) -> Duration {
        Duration::from_millis(self.send_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Never zero: a zero read timeout is rejected by the OS.
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms.max(1))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SocketConfig::default();
        assert_eq!(config.eviction_timeout(), Duration::from_secs(300));
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.family, AddressFamily::V4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SocketConfig =
            serde_json::from_str(r#"{"family":"v6","eviction_timeout_ms":5000}"#).unwrap();
        assert_eq!(config.family, AddressFamily::V6);
        assert_eq!(config.eviction_timeout(), Duration::from_secs(5));
        assert_eq!(config.send_backoff_ms, 100);
    }

    #[test]
    fn test_unbounded_handshake() {
        let config: SocketConfig =
            serde_json::from_str(r#"{"handshake_timeout_ms":null}"#).unwrap();
        assert_eq!(config.handshake_timeout(), None);

        let config = SocketConfig::default().with_handshake_timeout(None);
        assert!(config.handshake_timeout_ms.is_none());
    }

    #[test]
    fn test_builders() {
        let config = SocketConfig::default()
            .with_family(AddressFamily::V6)
            .with_eviction_timeout(Duration::from_millis(250))
            .with_send_backoff(Duration::from_millis(5))
            .with_receive_poll(Duration::ZERO);
        assert_eq!(config.eviction_timeout_ms, 250);
        assert_eq!(config.send_backoff(), Duration::from_millis(5));
        assert_eq!(config.receive_poll(), Duration::from_millis(1));
    }

    #[test]
    fn test_family_matching() {
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        assert!(AddressFamily::V4.matches(&v4));
        assert!(!AddressFamily::V4.matches(&v6));
        assert_eq!(AddressFamily::of(&v6), AddressFamily::V6);
        assert_eq!(AddressFamily::V6.unspecified(0).to_string(), "[::]:0");
    }
}
