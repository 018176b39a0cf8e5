//! ident-core — peer identity, addresses, wire format, and configuration.
//! All other ident crates depend on this one.

pub mod addr;
pub mod config;
pub mod crypto;
pub mod wire;

pub use addr::{has_consistent_transport, AddrError, PeerAddr, Transport};
pub use crypto::{CryptoError, Keypair, PeerId, PublicKey};
pub use wire::{DeltaMessage, IdentifyMessage, WireError};
