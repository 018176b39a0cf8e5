use std::time::Duration;

use ident_core::wire;
use ident_services::testing::TestNode;
use ident_services::{AddrTtl, Connection, IdentifyEvent, PeerStore};

use crate::{addr, node_addr, nodes};

/// Disconnect softens a peer's addresses; reconnecting restores them and
/// runs a fresh exchange.
#[tokio::test]
async fn test_reconnect_after_disconnect() -> anyhow::Result<()> {
    let mesh = nodes(2);
    let bid = mesh[1].peer_id();
    let (conn, _) = mesh[0].connect_and_identify(&mesh[1]).await?;

    conn.close().await;
    assert_eq!(mesh[0].service.ticket_count(), 0);
    assert_eq!(
        mesh[0].store.addr_ttls(&bid),
        vec![(addr(&node_addr(1)), AddrTtl::RecentlyConnected)]
    );
    // Protocols and key outlive the connection.
    assert!(!mesh[0].store.protocols(&bid).is_empty());
    assert!(mesh[0].store.pub_key(&bid).is_some());

    mesh[0].connect_and_identify(&mesh[1]).await?;
    assert_eq!(
        mesh[0].store.addr_ttls(&bid),
        vec![(addr(&node_addr(1)), AddrTtl::Connected)]
    );
    assert_eq!(mesh[0].host.opened_count(&bid, wire::ID), 2);
    Ok(())
}

/// A closed service stops pushing deltas but keeps answering and
/// identifying.
#[tokio::test]
async fn test_closed_service_keeps_identifying() -> anyhow::Result<()> {
    let a = TestNode::new(&["10.0.0.1:4001"]);
    let b = TestNode::new(&["10.0.0.2:4001"]);
    let c = TestNode::new(&["10.0.0.3:4001"]);
    a.connect_and_identify(&b).await?;

    a.service.close().await;
    a.bus.emit(IdentifyEvent::LocalProtocolsUpdated {
        added: vec!["/chat/1".to_string()],
        removed: Vec::new(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID_DELTA), 0);

    a.connect_and_identify(&c).await?;
    assert!(!a.store.protocols(&c.peer_id()).is_empty());
    assert!(!c.store.protocols(&a.peer_id()).is_empty());
    Ok(())
}
