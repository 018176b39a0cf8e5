//! Transport seam — what the identify engine needs from the connection layer.
//!
//! Dialing, stream multiplexing, and protocol negotiation all live on the
//! other side of these traits. The engine only opens streams on connections
//! it is told about and reads or writes one framed message per stream.

use std::sync::Arc;

use async_trait::async_trait;
use ident_core::{PeerAddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite};

/// Identifies one live connection for the lifetime of the process.
pub type ConnId = u64;

/// Whether we currently hold any connection to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    NotConnected,
    Connected,
}

/// A bidirectional stream on a connection.
#[async_trait]
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {
    /// The connection this stream runs on.
    fn conn(&self) -> Arc<dyn Connection>;

    /// The negotiated protocol, once there is one.
    fn protocol(&self) -> Option<&str>;

    /// Negotiate `protocol` as the opening side.
    async fn select_protocol(&mut self, protocol: &str) -> Result<(), TransportError>;

    /// Abort the stream. The remote sees an error instead of a clean close.
    fn reset(&mut self);
}

pub type BoxStream = Box<dyn Stream>;

/// A live transport-level link to a remote peer.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnId;
    fn local_peer(&self) -> PeerId;
    /// May be [`PeerId::EMPTY`] on transports that do not authenticate.
    fn remote_peer(&self) -> PeerId;
    fn local_addr(&self) -> PeerAddr;
    fn remote_addr(&self) -> PeerAddr;

    /// Open a fresh, un-negotiated stream.
    async fn new_stream(&self) -> Result<BoxStream, TransportError>;

    async fn close(&self);
}

/// The host's view of all its connections.
#[async_trait]
pub trait Network: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Addresses we listen on.
    fn listen_addrs(&self) -> Vec<PeerAddr>;

    /// Protocols we currently handle.
    fn protocols(&self) -> Vec<String>;

    /// Peers with at least one live connection.
    fn peers(&self) -> Vec<PeerId>;

    fn conns_to_peer(&self, peer: &PeerId) -> Vec<Arc<dyn Connection>>;

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.conns_to_peer(peer).is_empty() {
            Connectedness::NotConnected
        } else {
            Connectedness::Connected
        }
    }

    /// Open a negotiated stream to `peer` over an existing connection.
    /// Never dials.
    async fn new_stream(&self, peer: &PeerId, protocol: &str)
        -> Result<BoxStream, TransportError>;
}

/// Receives inbound streams whose protocol has already been negotiated.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: BoxStream);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open stream: {0}")]
    StreamOpen(String),

    #[error("protocol {0} not supported by remote")]
    ProtocolUnsupported(String),

    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("no connection to peer {0}")]
    NotConnected(PeerId),

    #[error("connection closed")]
    Closed,
}
