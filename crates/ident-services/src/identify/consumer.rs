//! Requester and push side: applying what a peer told us.

use std::sync::Arc;

use ident_core::wire::{self, DeltaMessage, IdentifyMessage};
use ident_core::{has_consistent_transport, PeerAddr, PeerId};

use super::IdService;
use crate::events::IdentifyEvent;
use crate::keys;
use crate::peer_store::{AddrTtl, AGENT_VERSION_KEY, PROTOCOL_VERSION_KEY};
use crate::transport::{BoxStream, Connectedness, Connection};

impl IdService {
    /// Apply a full identify payload received on `conn`.
    pub(crate) async fn consume_message(&self, msg: IdentifyMessage, conn: &Arc<dyn Connection>) {
        let store = &self.inner.store;
        let peer = conn.remote_peer();

        self.replace_protocols(&peer, msg.protocols);

        if let Some(bytes) = msg.observed_addr.as_deref() {
            self.consume_observed_addr(bytes, conn.as_ref());
        }

        let listen_addrs: Vec<PeerAddr> = msg
            .listen_addrs
            .iter()
            .filter_map(|bytes| match PeerAddr::from_bytes(bytes) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::debug!(peer = %peer.short(), error = %e, "skipping bad listen address");
                    None
                }
            })
            .collect();

        {
            let _guard = self.inner.addr_mu.lock().await;
            let ttl = match self.inner.network.connectedness(&peer) {
                Connectedness::Connected => AddrTtl::Connected,
                Connectedness::NotConnected => AddrTtl::RecentlyConnected,
            };
            // Downgrade before adding so the peer is never left with zero
            // live addresses.
            store.update_addrs(&peer, AddrTtl::Connected, AddrTtl::Transient);
            store.add_addrs(&peer, &listen_addrs, ttl);
        }
        tracing::debug!(peer = %peer.short(), addrs = listen_addrs.len(), "stored listen addresses");

        if let Some(v) = msg.protocol_version {
            store.put(&peer, PROTOCOL_VERSION_KEY, v);
        }
        if let Some(v) = msg.agent_version {
            store.put(&peer, AGENT_VERSION_KEY, v);
        }

        keys::reconcile(store.as_ref(), conn.as_ref(), msg.public_key.as_deref());
    }

    /// Replace the peer's protocol list and announce what changed.
    fn replace_protocols(&self, peer: &PeerId, protocols: Vec<String>) {
        let store = &self.inner.store;
        let before = store.protocols(peer);
        store.set_protocols(peer, &protocols);

        let added: Vec<String> = protocols
            .iter()
            .filter(|p| !before.contains(p))
            .cloned()
            .collect();
        let removed: Vec<String> = before
            .into_iter()
            .filter(|p| !protocols.contains(p))
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            self.inner.bus.emit(IdentifyEvent::PeerProtocolsUpdated {
                peer: *peer,
                added,
                removed,
            });
        }
    }

    /// Hand an observation of ourselves to the tracker. Never stored as an
    /// address of the peer.
    fn consume_observed_addr(&self, bytes: &[u8], conn: &dyn Connection) {
        let observed = match PeerAddr::from_bytes(bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(error = %e, "error parsing observed address");
                return;
            }
        };
        let listening = self.inner.network.listen_addrs();
        if !has_consistent_transport(&observed, &listening) {
            tracing::debug!(observed = %observed, "observed address uses none of our transports");
            return;
        }
        self.inner.observed.record(conn, observed);
    }

    /// An unsolicited full payload.
    pub(crate) async fn handle_push(&self, mut stream: BoxStream) {
        let conn = stream.conn();
        match wire::read_message::<_, IdentifyMessage>(&mut stream, self.inner.settings.max_message_size)
            .await
        {
            Ok(msg) => {
                tracing::debug!(peer = %conn.remote_peer().short(), "received identify push");
                self.consume_message(msg, &conn).await;
            }
            Err(e) => {
                tracing::warn!(peer = %conn.remote_peer().short(), error = %e, "error reading identify push");
                stream.reset();
            }
        }
    }

    /// An incremental protocol change.
    pub(crate) async fn handle_delta(&self, mut stream: BoxStream) {
        let conn = stream.conn();
        let peer = conn.remote_peer();
        let delta: DeltaMessage =
            match wire::read_message(&mut stream, self.inner.settings.max_message_size).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(peer = %peer.short(), error = %e, "error reading protocol delta");
                    stream.reset();
                    return;
                }
            };
        if delta.is_empty() {
            return;
        }

        let store = &self.inner.store;
        if !delta.added_protocols.is_empty() {
            store.add_protocols(&peer, &delta.added_protocols);
        }
        if !delta.rm_protocols.is_empty() {
            store.remove_protocols(&peer, &delta.rm_protocols);
        }
        tracing::debug!(
            peer = %peer.short(),
            added = delta.added_protocols.len(),
            removed = delta.rm_protocols.len(),
            "applied protocol delta"
        );
        self.inner.bus.emit(IdentifyEvent::PeerProtocolsUpdated {
            peer,
            added: delta.added_protocols,
            removed: delta.rm_protocols,
        });
    }
}

#[cfg(test)]
mod tests {
    use ident_core::config::IdentifyConfig;

    use super::*;
    use crate::peer_store::PeerStore;
    use crate::testing::{next_event, TestNode};
    use crate::transport::Network;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn protocols_are_replaced_not_merged() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        b.add_protocols(&["/chat/1"]);
        a.store.set_protocols(&b.peer_id(), &["/stale/1".to_string()]);

        a.connect_and_identify(&b).await.unwrap();

        let mut got = a.store.protocols(&b.peer_id());
        got.sort();
        let mut want = b.host.protocols();
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn protocol_change_is_announced() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let mut events = a.bus.subscribe();
        let bid = b.peer_id();

        a.connect_and_identify(&b).await.unwrap();

        let event = next_event(&mut events, |e| {
            matches!(e, IdentifyEvent::PeerProtocolsUpdated { peer, .. } if *peer == bid)
        })
        .await;
        match event {
            Some(IdentifyEvent::PeerProtocolsUpdated { added, removed, .. }) => {
                assert!(added.contains(&wire::ID.to_string()));
                assert!(removed.is_empty());
            }
            other => panic!("expected protocol update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn observed_address_never_becomes_a_peer_address() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect_and_identify(&b).await.unwrap();
        let before = a.store.addrs(&b.peer_id());
        let tracked = a.observed.tracked();

        let msg = IdentifyMessage {
            observed_addr: Some(addr("198.51.100.7:4001").to_bytes()),
            ..IdentifyMessage::default()
        };
        let conn: Arc<dyn Connection> = conn;
        a.service.consume_message(msg, &conn).await;

        assert_eq!(a.store.addrs(&b.peer_id()), before);
        assert_eq!(a.observed.tracked(), tracked + 1);
    }

    #[tokio::test]
    async fn observation_on_foreign_transport_is_ignored() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect_and_identify(&b).await.unwrap();
        let tracked = a.observed.tracked();

        let msg = IdentifyMessage {
            observed_addr: Some(addr("[2001:db8::7]:4001").to_bytes()),
            ..IdentifyMessage::default()
        };
        let conn: Arc<dyn Connection> = conn;
        a.service.consume_message(msg, &conn).await;
        assert_eq!(a.observed.tracked(), tracked);
    }

    #[tokio::test]
    async fn bad_listen_addresses_are_skipped_and_ttls_rotate() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect_and_identify(&b).await.unwrap();
        assert_eq!(
            a.store.addr_ttls(&b.peer_id()),
            vec![(addr("10.0.0.2:4001"), AddrTtl::Connected)]
        );

        let msg = IdentifyMessage {
            listen_addrs: vec![
                b"garbage".to_vec(),
                vec![0xff, 0x00],
                addr("10.0.0.9:4001").to_bytes(),
            ],
            ..IdentifyMessage::default()
        };
        let conn: Arc<dyn Connection> = conn;
        a.service.consume_message(msg, &conn).await;

        let mut ttls = a.store.addr_ttls(&b.peer_id());
        ttls.sort();
        assert_eq!(
            ttls,
            vec![
                (addr("10.0.0.2:4001"), AddrTtl::Transient),
                (addr("10.0.0.9:4001"), AddrTtl::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn versions_and_key_are_recorded() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.connect_and_identify(&b).await.unwrap();

        let bid = b.peer_id();
        assert_eq!(
            a.store.get(&bid, PROTOCOL_VERSION_KEY).as_deref(),
            Some(wire::PROTOCOL_VERSION)
        );
        assert_eq!(
            a.store.get(&bid, AGENT_VERSION_KEY),
            Some(IdentifyConfig::default().agent_version)
        );
        assert_eq!(a.store.pub_key(&bid), Some(b.host.keypair().public));
    }

    #[tokio::test]
    async fn keyless_peer_leaves_no_key() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::without_key(&["10.0.0.2:4001"]);
        a.connect_and_identify(&b).await.unwrap();
        assert!(a.store.pub_key(&b.peer_id()).is_none());
        assert!(!a.store.protocols(&b.peer_id()).is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_connection_adopts_derived_identity() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.host.connect_unauthenticated(&b.host);
        a.service.identify_conn(conn).await.unwrap();
        assert_eq!(a.store.pub_key(&b.peer_id()), Some(b.host.keypair().public));
    }
}
