//! Peer store — accumulated knowledge about remote peers.
//!
//! Per peer: the protocols it speaks (replaced wholesale on every full
//! identify), the addresses it announced (each tagged with a TTL class),
//! its public key, and opaque string metadata such as version strings.
//!
//! The store makes each individual call safe to run concurrently. Multi-step
//! TTL transitions (downgrade, then add) are serialized by the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ident_core::{PeerAddr, PeerId, PublicKey};
use tokio::time::Instant;

/// Metadata key under which the peer's protocol version is stored.
pub const PROTOCOL_VERSION_KEY: &str = "ProtocolVersion";

/// Metadata key under which the peer's agent version is stored.
pub const AGENT_VERSION_KEY: &str = "AgentVersion";

/// How long a short-lived, invalidated address survives.
pub const TRANSIENT_ADDR_TTL: Duration = Duration::from_secs(10);

/// How long addresses survive after the last connection to a peer closes.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Named expiry policy for a stored address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddrTtl {
    /// Previously good, now being replaced.
    Transient,
    /// The peer was connected recently.
    RecentlyConnected,
    /// The peer is connected right now. Never expires on its own.
    Connected,
}

impl AddrTtl {
    /// `None` means no expiry.
    pub fn duration(self) -> Option<Duration> {
        match self {
            AddrTtl::Transient => Some(TRANSIENT_ADDR_TTL),
            AddrTtl::RecentlyConnected => Some(RECENTLY_CONNECTED_ADDR_TTL),
            AddrTtl::Connected => None,
        }
    }

    fn expiry_from(self, now: Instant) -> Option<Instant> {
        self.duration().map(|d| now + d)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("public key does not belong to peer {0}")]
    KeyMismatch(PeerId),

    #[error("peer store unavailable: {0}")]
    Unavailable(String),
}

/// Storage the identify engine reads and writes.
pub trait PeerStore: Send + Sync {
    /// Replace the peer's protocol list.
    fn set_protocols(&self, peer: &PeerId, protocols: &[String]);
    fn add_protocols(&self, peer: &PeerId, protocols: &[String]);
    fn remove_protocols(&self, peer: &PeerId, protocols: &[String]);
    fn protocols(&self, peer: &PeerId) -> Vec<String>;

    /// The subset of `protocols` the peer is known to support.
    fn supports_protocols(&self, peer: &PeerId, protocols: &[&str])
        -> Result<Vec<String>, StoreError>;

    /// Add addresses with the given TTL class. Never shortens the lifetime of
    /// an address already stored.
    fn add_addrs(&self, peer: &PeerId, addrs: &[PeerAddr], ttl: AddrTtl);

    /// Move every live address of class `from` to class `to`.
    fn update_addrs(&self, peer: &PeerId, from: AddrTtl, to: AddrTtl);

    /// Live (unexpired) addresses.
    fn addrs(&self, peer: &PeerId) -> Vec<PeerAddr>;

    /// Store a public key. Fails if the key does not derive `peer`.
    fn add_pub_key(&self, peer: &PeerId, key: PublicKey) -> Result<(), StoreError>;
    fn pub_key(&self, peer: &PeerId) -> Option<PublicKey>;

    fn put(&self, peer: &PeerId, key: &str, value: String);
    fn get(&self, peer: &PeerId, key: &str) -> Option<String>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct AddrEntry {
    ttl: AddrTtl,
    expires: Option<Instant>,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |t| t > now)
    }
}

/// Everything known about one peer.
#[derive(Debug, Default)]
struct PeerRecord {
    protocols: Vec<String>,
    addrs: HashMap<PeerAddr, AddrEntry>,
    public_key: Option<PublicKey>,
    metadata: HashMap<String, String>,
}

/// DashMap-backed [`PeerStore`]. Records persist across reconnects; only
/// addresses expire.
pub struct MemoryPeerStore {
    records: Arc<DashMap<PeerId, PeerRecord>>,
}

impl Default for MemoryPeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }

    /// Live addresses together with their TTL class.
    pub fn addr_ttls(&self, peer: &PeerId) -> Vec<(PeerAddr, AddrTtl)> {
        let now = Instant::now();
        self.records
            .get(peer)
            .map(|r| {
                r.addrs
                    .iter()
                    .filter(|(_, e)| e.is_live(now))
                    .map(|(a, e)| (*a, e.ttl))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Peers we hold any record for.
    pub fn peers(&self) -> Vec<PeerId> {
        self.records.iter().map(|entry| *entry.key()).collect()
    }

    /// Store a key without checking it against the peer id.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_pub_key(&self, peer: &PeerId, key: PublicKey) {
        self.records.entry(*peer).or_default().public_key = Some(key);
    }
}

impl Clone for MemoryPeerStore {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

impl PeerStore for MemoryPeerStore {
    fn set_protocols(&self, peer: &PeerId, protocols: &[String]) {
        let mut deduped: Vec<String> = Vec::with_capacity(protocols.len());
        for p in protocols {
            if !deduped.contains(p) {
                deduped.push(p.clone());
            }
        }
        self.records.entry(*peer).or_default().protocols = deduped;
    }

    fn add_protocols(&self, peer: &PeerId, protocols: &[String]) {
        let mut record = self.records.entry(*peer).or_default();
        for p in protocols {
            if !record.protocols.contains(p) {
                record.protocols.push(p.clone());
            }
        }
    }

    fn remove_protocols(&self, peer: &PeerId, protocols: &[String]) {
        if let Some(mut record) = self.records.get_mut(peer) {
            record.protocols.retain(|p| !protocols.contains(p));
        }
    }

    fn protocols(&self, peer: &PeerId) -> Vec<String> {
        self.records
            .get(peer)
            .map(|r| r.protocols.clone())
            .unwrap_or_default()
    }

    fn supports_protocols(
        &self,
        peer: &PeerId,
        protocols: &[&str],
    ) -> Result<Vec<String>, StoreError> {
        let Some(record) = self.records.get(peer) else {
            return Ok(Vec::new());
        };
        Ok(protocols
            .iter()
            .filter(|p| record.protocols.iter().any(|have| have == *p))
            .map(|p| p.to_string())
            .collect())
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[PeerAddr], ttl: AddrTtl) {
        if addrs.is_empty() {
            return;
        }
        let now = Instant::now();
        let expires = ttl.expiry_from(now);
        let mut record = self.records.entry(*peer).or_default();
        for addr in addrs {
            let entry = record
                .addrs
                .entry(*addr)
                .or_insert(AddrEntry { ttl, expires });
            let outlives = match (entry.is_live(now), entry.expires, expires) {
                (false, _, _) => false,
                (true, None, _) => true,
                (true, Some(_), None) => false,
                (true, Some(current), Some(new)) => current >= new,
            };
            if !outlives {
                *entry = AddrEntry { ttl, expires };
            }
        }
    }

    fn update_addrs(&self, peer: &PeerId, from: AddrTtl, to: AddrTtl) {
        let Some(mut record) = self.records.get_mut(peer) else {
            return;
        };
        let now = Instant::now();
        let expires = to.expiry_from(now);
        for entry in record.addrs.values_mut() {
            if entry.ttl == from && entry.is_live(now) {
                *entry = AddrEntry { ttl: to, expires };
            }
        }
        record.addrs.retain(|_, e| e.is_live(now));
    }

    fn addrs(&self, peer: &PeerId) -> Vec<PeerAddr> {
        self.addr_ttls(peer).into_iter().map(|(a, _)| a).collect()
    }

    fn add_pub_key(&self, peer: &PeerId, key: PublicKey) -> Result<(), StoreError> {
        if key.peer_id() != *peer {
            return Err(StoreError::KeyMismatch(*peer));
        }
        self.records.entry(*peer).or_default().public_key = Some(key);
        Ok(())
    }

    fn pub_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.records.get(peer).and_then(|r| r.public_key)
    }

    fn put(&self, peer: &PeerId, key: &str, value: String) {
        self.records
            .entry(*peer)
            .or_default()
            .metadata
            .insert(key.to_string(), value);
    }

    fn get(&self, peer: &PeerId, key: &str) -> Option<String> {
        self.records
            .get(peer)
            .and_then(|r| r.metadata.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ident_core::Keypair;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    fn peer() -> PeerId {
        Keypair::generate().peer_id()
    }

    #[test]
    fn set_protocols_replaces_wholesale() {
        let store = MemoryPeerStore::new();
        let p = peer();
        store.set_protocols(&p, &["/a/1".into(), "/b/1".into()]);
        store.set_protocols(&p, &["/c/1".into()]);
        assert_eq!(store.protocols(&p), vec!["/c/1".to_string()]);
    }

    #[test]
    fn add_and_remove_protocols() {
        let store = MemoryPeerStore::new();
        let p = peer();
        store.set_protocols(&p, &["/a/1".into()]);
        store.add_protocols(&p, &["/a/1".into(), "/b/1".into()]);
        assert_eq!(store.protocols(&p), vec!["/a/1".to_string(), "/b/1".to_string()]);
        store.remove_protocols(&p, &["/a/1".into()]);
        assert_eq!(store.protocols(&p), vec!["/b/1".to_string()]);
    }

    #[test]
    fn supports_protocols_intersects() {
        let store = MemoryPeerStore::new();
        let p = peer();
        assert!(store.supports_protocols(&p, &["/a/1"]).unwrap().is_empty());
        store.set_protocols(&p, &["/a/1".into(), "/b/1".into()]);
        assert_eq!(
            store.supports_protocols(&p, &["/b/1", "/z/1"]).unwrap(),
            vec!["/b/1".to_string()]
        );
    }

    #[test]
    fn shorter_ttl_never_downgrades() {
        let store = MemoryPeerStore::new();
        let p = peer();
        let a = addr("10.0.0.1:4001");
        store.add_addrs(&p, &[a], AddrTtl::Connected);
        store.add_addrs(&p, &[a], AddrTtl::RecentlyConnected);
        assert_eq!(store.addr_ttls(&p), vec![(a, AddrTtl::Connected)]);
    }

    #[test]
    fn update_moves_only_matching_class() {
        let store = MemoryPeerStore::new();
        let p = peer();
        let a = addr("10.0.0.1:4001");
        let b = addr("10.0.0.2:4001");
        store.add_addrs(&p, &[a], AddrTtl::Connected);
        store.add_addrs(&p, &[b], AddrTtl::RecentlyConnected);

        store.update_addrs(&p, AddrTtl::Connected, AddrTtl::Transient);

        let mut ttls = store.addr_ttls(&p);
        ttls.sort();
        assert_eq!(
            ttls,
            vec![(a, AddrTtl::Transient), (b, AddrTtl::RecentlyConnected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_addresses_expire() {
        let store = MemoryPeerStore::new();
        let p = peer();
        let a = addr("10.0.0.1:4001");
        store.add_addrs(&p, &[a], AddrTtl::Connected);
        store.update_addrs(&p, AddrTtl::Connected, AddrTtl::Transient);
        assert_eq!(store.addrs(&p), vec![a]);

        tokio::time::advance(TRANSIENT_ADDR_TTL + Duration::from_secs(1)).await;
        assert!(store.addrs(&p).is_empty());
    }

    #[test]
    fn add_pub_key_checks_identity() {
        let store = MemoryPeerStore::new();
        let kp = Keypair::generate();
        let other = Keypair::generate();
        assert!(matches!(
            store.add_pub_key(&kp.peer_id(), other.public),
            Err(StoreError::KeyMismatch(_))
        ));
        assert!(store.pub_key(&kp.peer_id()).is_none());

        store.add_pub_key(&kp.peer_id(), kp.public).unwrap();
        assert_eq!(store.pub_key(&kp.peer_id()), Some(kp.public));
    }

    #[test]
    fn metadata_put_get() {
        let store = MemoryPeerStore::new();
        let p = peer();
        assert!(store.get(&p, AGENT_VERSION_KEY).is_none());
        store.put(&p, AGENT_VERSION_KEY, "ident/test".into());
        assert_eq!(store.get(&p, AGENT_VERSION_KEY).as_deref(), Some("ident/test"));
    }
}
