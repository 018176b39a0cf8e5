use ident_core::wire;
use ident_services::testing::{eventually, next_event, TestNode};
use ident_services::{IdentifyEvent, PeerStore};

use crate::{full_mesh, nodes};

/// A local protocol change reaches every connected peer as a delta.
#[tokio::test]
async fn test_protocol_change_reaches_every_peer() -> anyhow::Result<()> {
    let mesh = nodes(4);
    full_mesh(&mesh).await?;
    let origin = &mesh[0];

    origin.add_protocols(&["/chat/1"]);
    origin.bus.emit(IdentifyEvent::LocalProtocolsUpdated {
        added: vec!["/chat/1".to_string()],
        removed: Vec::new(),
    });

    let oid = origin.peer_id();
    for peer in &mesh[1..] {
        assert!(
            eventually(|| peer.store.protocols(&oid).contains(&"/chat/1".to_string())).await,
            "peer never saw the new protocol"
        );
        assert_eq!(origin.host.opened_count(&peer.peer_id(), wire::ID_DELTA), 1);
    }
    Ok(())
}

/// Peers that do not speak the delta protocol are skipped; the others
/// still get it.
#[tokio::test]
async fn test_delta_skips_peers_without_the_protocol() -> anyhow::Result<()> {
    let origin = TestNode::new(&["10.0.0.1:4001"]);
    let modern = TestNode::new(&["10.0.0.2:4001"]);
    let legacy = TestNode::new(&["10.0.0.3:4001"]);
    legacy
        .host
        .set_protocols(vec![wire::ID.to_string(), wire::ID_PUSH.to_string()]);
    origin.connect_and_identify(&modern).await?;
    origin.connect_and_identify(&legacy).await?;
    let mut events = modern.bus.subscribe();

    origin
        .service
        .fire_protocol_delta(vec!["/chat/1".to_string()], Vec::new())
        .expect("non-empty delta")
        .await?;

    assert_eq!(origin.host.opened_count(&modern.peer_id(), wire::ID_DELTA), 1);
    assert_eq!(origin.host.opened_count(&legacy.peer_id(), wire::ID_DELTA), 0);
    let update = next_event(&mut events, |e| {
        matches!(e, IdentifyEvent::PeerProtocolsUpdated { .. })
    })
    .await;
    assert!(update.is_some());
    Ok(())
}

/// Push waits for a connection still being identified before sending.
#[tokio::test]
async fn test_push_waits_for_identification() -> anyhow::Result<()> {
    let mesh = nodes(2);
    let (ours, _) = mesh[0].connect(&mesh[1]);

    mesh[0].service.push().await?;

    assert!(mesh[0].service.identify_wait(ours).is_done());
    assert_eq!(mesh[0].host.opened_count(&mesh[1].peer_id(), wire::ID_PUSH), 1);
    Ok(())
}
