//! Peer addresses.
//!
//! The identify engine treats addresses as opaque comparable values. It only
//! ever asks three questions of one: is it equal to another, is it loopback,
//! and does it run over the same transport as some other address.
//!
//! On the wire an address is the UTF-8 text of its socket form,
//! e.g. `192.0.2.7:4001` or `[2001:db8::1]:4001`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Transport family an address runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Ip4,
    Ip6,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(SocketAddr);

impl PeerAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_loopback(&self) -> bool {
        self.0.ip().is_loopback()
    }

    pub fn transport(&self) -> Transport {
        match self.0 {
            SocketAddr::V4(_) => Transport::Ip4,
            SocketAddr::V6(_) => Transport::Ip6,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AddrError> {
        let text = std::str::from_utf8(data).map_err(|_| AddrError::NotUtf8)?;
        text.parse()
    }
}

/// True if `addr` runs over the same transport as any address in `green`.
///
/// Used to check whether an address might plausibly be one a node listens on.
pub fn has_consistent_transport(addr: &PeerAddr, green: &[PeerAddr]) -> bool {
    green.iter().any(|g| g.transport() == addr.transport())
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| AddrError::Invalid(s.to_string()))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({})", self.0)
    }
}

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("address is not valid UTF-8")]
    NotUtf8,
    #[error("invalid address {0:?}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[test]
    fn wire_form_is_socket_text() {
        let a = addr("192.0.2.7:4001");
        assert_eq!(a.to_bytes(), b"192.0.2.7:4001".to_vec());
        assert_eq!(PeerAddr::from_bytes(&a.to_bytes()).unwrap(), a);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(matches!(
            PeerAddr::from_bytes(&[0xff, 0xfe]),
            Err(AddrError::NotUtf8)
        ));
        assert!(matches!(
            PeerAddr::from_bytes(b"not an address"),
            Err(AddrError::Invalid(_))
        ));
    }

    #[test]
    fn loopback_detection() {
        assert!(addr("127.0.0.1:1").is_loopback());
        assert!(addr("[::1]:1").is_loopback());
        assert!(!addr("10.0.0.1:1").is_loopback());
    }

    #[test]
    fn consistent_transport_compares_family() {
        let green = [addr("10.0.0.1:4001")];
        assert!(has_consistent_transport(&addr("198.51.100.3:9999"), &green));
        assert!(!has_consistent_transport(&addr("[2001:db8::1]:4001"), &green));
        assert!(!has_consistent_transport(&addr("10.0.0.1:4001"), &[]));
    }
}
