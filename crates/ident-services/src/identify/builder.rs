//! Responder side: building our identify payload.

use ident_core::wire::{self, IdentifyMessage, WireError};
use tokio::io::AsyncWriteExt;

use super::IdService;
use crate::transport::{BoxStream, Connection};

impl IdService {
    /// Our current state as seen through `conn`.
    ///
    /// Loopback listen addresses are only announced over loopback
    /// connections. The observed address is the remote end of `conn`.
    pub fn populate_message(&self, conn: &dyn Connection) -> IdentifyMessage {
        let network = &self.inner.network;
        let loopback_conn = conn.local_addr().is_loopback() || conn.remote_addr().is_loopback();

        let listen_addrs = network
            .listen_addrs()
            .into_iter()
            .filter(|a| loopback_conn || !a.is_loopback())
            .map(|a| a.to_bytes())
            .collect();

        let public_key = match &self.inner.local_key {
            Some(key) => Some(key.to_bytes()),
            None => {
                tracing::debug!(peer = %conn.remote_peer().short(), "no local key to announce");
                None
            }
        };

        IdentifyMessage {
            protocols: network.protocols(),
            listen_addrs,
            observed_addr: Some(conn.remote_addr().to_bytes()),
            public_key,
            protocol_version: Some(wire::PROTOCOL_VERSION.to_string()),
            agent_version: Some(self.inner.settings.agent_version.clone()),
        }
    }

    /// Write a fresh payload for the stream's connection.
    pub(crate) async fn write_identify(&self, stream: &mut BoxStream) -> Result<(), WireError> {
        let msg = self.populate_message(stream.conn().as_ref());
        wire::write_message(stream, &msg, self.inner.settings.max_message_size).await
    }

    /// Answer an identify request: one payload, then close.
    pub(crate) async fn handle_request(&self, mut stream: BoxStream) {
        let peer = stream.conn().remote_peer();
        match self.write_identify(&mut stream).await {
            Ok(()) => {
                let _ = stream.shutdown().await;
                tracing::debug!(peer = %peer.short(), "sent identify message");
            }
            Err(e) => {
                tracing::warn!(peer = %peer.short(), error = %e, "failed to send identify message");
                stream.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ident_core::PeerAddr;

    use crate::testing::TestNode;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn loopback_addresses_only_over_loopback() {
        let a = TestNode::new(&["10.0.0.1:4001", "127.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (_, a_side) = b.connect(&a);

        let msg = a.service.populate_message(&*a_side);
        assert_eq!(msg.listen_addrs, vec![addr("10.0.0.1:4001").to_bytes()]);
        assert_eq!(msg.observed_addr, Some(addr("10.0.0.2:4001").to_bytes()));

        let local = TestNode::new(&["127.0.0.1:5001"]);
        let (_, a_side) = local.connect(&a);
        let msg = a.service.populate_message(&*a_side);
        assert_eq!(
            msg.listen_addrs,
            vec![
                addr("10.0.0.1:4001").to_bytes(),
                addr("127.0.0.1:4001").to_bytes()
            ]
        );
    }

    #[tokio::test]
    async fn payload_carries_local_state() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.add_protocols(&["/chat/1"]);
        let (_, a_side) = b.connect(&a);

        let msg = a.service.populate_message(&*a_side);
        assert!(msg.protocols.contains(&"/chat/1".to_string()));
        assert_eq!(msg.public_key, Some(a.host.keypair().public.to_bytes()));
        assert_eq!(msg.protocol_version.as_deref(), Some(ident_core::wire::PROTOCOL_VERSION));
        assert!(msg.agent_version.is_some());
    }

    #[tokio::test]
    async fn keyless_node_omits_key() {
        let a = TestNode::without_key(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (_, a_side) = b.connect(&a);
        assert!(a.service.populate_message(&*a_side).public_key.is_none());
    }
}
