use ident_services::testing::{eventually, TestNode};
use ident_services::{AddrTtl, PeerStore};

use crate::{addr, node_addr, nodes};

/// The hub's own address becomes vetted only once four distinct peers have
/// reported seeing it.
#[tokio::test]
async fn test_observed_address_needs_four_observers() -> anyhow::Result<()> {
    let hub = TestNode::new(&[node_addr(0).as_str()]);
    let spokes = (1..=4).map(|i| TestNode::new(&[node_addr(i).as_str()])).collect::<Vec<_>>();

    for spoke in &spokes[..3] {
        hub.connect_and_identify(spoke).await?;
    }
    assert!(hub.service.own_observed_addrs().is_empty());

    hub.connect_and_identify(&spokes[3]).await?;
    let me = addr(&node_addr(0));
    assert_eq!(hub.service.own_observed_addrs(), vec![me]);
    assert_eq!(hub.service.observed_addrs_for(&me), vec![me]);
    assert!(hub
        .service
        .observed_addrs_for(&addr("10.9.9.9:4001"))
        .is_empty());

    // Observations are never stored as addresses of the observers.
    for spoke in &spokes {
        assert!(!hub.store.addrs(&spoke.peer_id()).contains(&me));
    }
    Ok(())
}

/// A peer that moves pushes its new addresses; the old one is kept only
/// transiently.
#[tokio::test]
async fn test_moved_peer_replaces_its_addresses() -> anyhow::Result<()> {
    let mesh = nodes(2);
    mesh[0].connect_and_identify(&mesh[1]).await?;
    let bid = mesh[1].peer_id();

    mesh[1].host.set_listen_addrs(vec![addr("10.0.1.2:4001")]);
    mesh[1].service.push().await?;

    let store = &mesh[0].store;
    assert!(eventually(|| store.addrs(&bid).contains(&addr("10.0.1.2:4001"))).await);
    let mut ttls = store.addr_ttls(&bid);
    ttls.sort();
    assert_eq!(
        ttls,
        vec![
            (addr(&node_addr(1)), AddrTtl::Transient),
            (addr("10.0.1.2:4001"), AddrTtl::Connected),
        ]
    );
    Ok(())
}

/// Loopback listen addresses stay private unless the connection itself is
/// loopback.
#[tokio::test]
async fn test_loopback_addresses_stay_local() -> anyhow::Result<()> {
    let public = TestNode::new(&["10.0.0.1:4001"]);
    let dual = TestNode::new(&["10.0.0.2:4001", "127.0.0.1:4002"]);
    let local = TestNode::new(&["127.0.0.1:4003"]);

    public.connect_and_identify(&dual).await?;
    local.connect_and_identify(&dual).await?;

    assert_eq!(public.store.addrs(&dual.peer_id()), vec![addr("10.0.0.2:4001")]);
    let mut seen_locally = local.store.addrs(&dual.peer_id());
    seen_locally.sort();
    assert_eq!(
        seen_locally,
        vec![addr("10.0.0.2:4001"), addr("127.0.0.1:4002")]
    );
    Ok(())
}
