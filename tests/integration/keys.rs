use ident_services::testing::TestNode;
use ident_services::PeerStore;

use crate::nodes;

/// Keys learned through identify always derive the id they are stored
/// under.
#[tokio::test]
async fn test_learned_keys_match_peer_ids() -> anyhow::Result<()> {
    let mesh = nodes(3);
    crate::full_mesh(&mesh).await?;

    for a in &mesh {
        for b in &mesh {
            if let Some(key) = a.store.pub_key(&b.peer_id()) {
                assert_eq!(key.peer_id(), b.peer_id());
            }
        }
    }
    Ok(())
}

/// A key already on file is never replaced by a different announced key.
#[tokio::test]
async fn test_existing_key_is_not_overwritten() -> anyhow::Result<()> {
    let mesh = nodes(3);
    let bid = mesh[1].peer_id();
    let stale = mesh[2].host.keypair().public;
    mesh[0].store.force_pub_key(&bid, stale);

    mesh[0].connect_and_identify(&mesh[1]).await?;

    assert_eq!(mesh[0].store.pub_key(&bid), Some(stale));
    assert!(!mesh[0].store.protocols(&bid).is_empty());
    Ok(())
}

/// A node configured not to announce a key still gets identified, but
/// leaves no key behind.
#[tokio::test]
async fn test_keyless_node_is_identified_without_key() -> anyhow::Result<()> {
    let a = TestNode::new(&["10.0.0.1:4001"]);
    let b = TestNode::without_key(&["10.0.0.2:4001"]);
    a.connect_and_identify(&b).await?;

    assert!(a.store.pub_key(&b.peer_id()).is_none());
    assert_eq!(b.store.pub_key(&a.peer_id()), Some(a.host.keypair().public));
    Ok(())
}
