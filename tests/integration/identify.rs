use futures::future::join_all;
use ident_core::wire;
use ident_services::peer_store::{AGENT_VERSION_KEY, PROTOCOL_VERSION_KEY};
use ident_services::{IdentifyError, Network, PeerStore};

use crate::{addr, full_mesh, node_addr, nodes};

/// Every node in a mesh learns every other node's protocols, versions,
/// key and listen address.
#[tokio::test]
async fn test_full_mesh_identifies_everyone() -> anyhow::Result<()> {
    let mesh = nodes(4);
    mesh[2].add_protocols(&["/chat/1"]);
    full_mesh(&mesh).await?;

    for (i, a) in mesh.iter().enumerate() {
        for (j, b) in mesh.iter().enumerate() {
            if i == j {
                continue;
            }
            let bid = b.peer_id();
            let mut protocols = a.store.protocols(&bid);
            protocols.sort();
            let mut want = b.host.protocols();
            want.sort();
            assert_eq!(protocols, want, "node {i} view of node {j}");

            assert_eq!(a.store.pub_key(&bid), Some(b.host.keypair().public));
            assert_eq!(
                a.store.get(&bid, PROTOCOL_VERSION_KEY).as_deref(),
                Some(wire::PROTOCOL_VERSION)
            );
            assert!(a.store.get(&bid, AGENT_VERSION_KEY).is_some());
            assert_eq!(a.store.addrs(&bid), vec![addr(&node_addr(j))]);
        }
    }
    Ok(())
}

/// Both ends identify at the same time; each side still runs exactly one
/// exchange per connection.
#[tokio::test]
async fn test_simultaneous_identify_from_both_ends() -> anyhow::Result<()> {
    let mesh = nodes(2);
    let (ours, theirs) = mesh[0].connect(&mesh[1]);

    let mut waits = Vec::new();
    for _ in 0..8 {
        waits.push(mesh[0].service.identify_wait(ours.clone()));
        waits.push(mesh[1].service.identify_wait(theirs.clone()));
    }
    let outcomes = join_all(waits.iter().map(|s| s.wait())).await;
    assert!(outcomes.iter().all(Result::is_ok));

    assert_eq!(mesh[0].host.opened_count(&mesh[1].peer_id(), wire::ID), 1);
    assert_eq!(mesh[1].host.opened_count(&mesh[0].peer_id(), wire::ID), 1);
    Ok(())
}

/// A peer that does not speak identify fails identification but stays
/// connected.
#[tokio::test]
async fn test_peer_without_identify_stays_connected() {
    let mesh = nodes(2);
    mesh[1].host.set_protocols(vec!["/chat/1".to_string()]);

    let (conn, _) = mesh[0].connect(&mesh[1]);
    let res = mesh[0].service.identify_conn(conn.clone()).await;

    assert!(matches!(res, Err(IdentifyError::Negotiation(_))));
    assert!(!conn.is_closed());
    assert!(mesh[0].store.protocols(&mesh[1].peer_id()).is_empty());
}
