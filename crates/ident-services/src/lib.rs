//! ident-services — the identify engine and the seams it runs against.

pub mod events;
pub mod identify;
pub mod keys;
pub mod observed;
pub mod peer_store;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use events::{EventBus, IdentifyEvent};
pub use identify::{ConnectionWatcher, IdService, IdentifyError, IdentifySignal, PayloadWriter};
pub use keys::{decide, reconcile, KeyDecision};
pub use observed::{ObservedAddrManager, ObservedAddrs};
pub use peer_store::{AddrTtl, MemoryPeerStore, PeerStore, StoreError};
pub use transport::{
    BoxStream, ConnId, Connectedness, Connection, Network, Stream, StreamHandler, TransportError,
};
